//! Bootloader protocol
//!
//! Frame format:
//! - 3 bytes: sync
//! - 1 byte: opcode
//! - 1 byte: error code (0 in requests)
//! - 4 bytes: address (little-endian)
//! - 4 bytes: payload length (little-endian)
//! - N bytes: payload
//! - 2 bytes: checksum, truncated 16-bit sum of all preceding bytes (little-endian)
//!
//! Every request is answered by a reply of exactly the same length.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::BootloaderError;

/// Leading bytes of every bootloader frame
pub const SYNC: [u8; 3] = [0xAA, 0x55, 0xAA];

/// Size of the fixed header preceding the payload
pub const HEADER_SIZE: usize = 13;

/// Size of the trailing checksum
pub const CHECKSUM_SIZE: usize = 2;

/// Largest page size accepted from a ReadPageSize reply
pub const MAX_PAGE_SIZE: u32 = 64 * 1024;

const OPCODE_OFFSET: usize = 3;
const ERROR_OFFSET: usize = 4;
const ADDRESS_OFFSET: usize = 5;
const LENGTH_OFFSET: usize = 9;

/// Bootloader commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Program one page at the frame address
    WritePage = 0x00,
    /// Query the page size, answered in the address field
    ReadPageSize = 0x66,
    /// Leave the bootloader and start the application
    ExitBootloader = 0x77,
}

/// Error codes reported by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    /// Failure without a specific cause
    Undefined,
    /// Page address outside the application area or not page aligned
    InvalidAddress,
    /// Payload length different from the page size
    InvalidDataLength,
    /// Any code this host does not know
    Other(u8),
}

impl DeviceErrorCode {
    /// Decode an error byte; zero means success
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => None,
            1 => Some(DeviceErrorCode::Undefined),
            2 => Some(DeviceErrorCode::InvalidAddress),
            3 => Some(DeviceErrorCode::InvalidDataLength),
            other => Some(DeviceErrorCode::Other(other)),
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorCode::Undefined => write!(f, "undefined error"),
            DeviceErrorCode::InvalidAddress => write!(f, "invalid address"),
            DeviceErrorCode::InvalidDataLength => write!(f, "invalid data length"),
            DeviceErrorCode::Other(code) => write!(f, "error code {}", code),
        }
    }
}

/// Truncated 16-bit sum of `bytes`
pub fn checksum16(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(b as u16))
}

/// One bootloader request or reply
#[derive(Clone, PartialEq, Eq)]
pub struct BootloaderFrame {
    bytes: Vec<u8>,
}

impl BootloaderFrame {
    /// Build a request
    pub fn new(opcode: Opcode, address: u32, payload: &[u8]) -> Self {
        Self::with_error(opcode as u8, 0, address, payload)
    }

    /// Build a frame with an explicit error byte, as sent by the bootloader
    pub fn with_error(opcode: u8, error: u8, address: u32, payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
        bytes.extend_from_slice(&SYNC);
        bytes.push(opcode);
        bytes.push(error);

        let mut field = [0u8; 4];
        LittleEndian::write_u32(&mut field, address);
        bytes.extend_from_slice(&field);
        LittleEndian::write_u32(&mut field, payload.len() as u32);
        bytes.extend_from_slice(&field);
        bytes.extend_from_slice(payload);

        let mut sum = [0u8; 2];
        LittleEndian::write_u16(&mut sum, checksum16(&bytes));
        bytes.extend_from_slice(&sum);
        Self { bytes }
    }

    /// Payload-less ReadPageSize request
    pub fn read_page_size() -> Self {
        Self::new(Opcode::ReadPageSize, 0, &[])
    }

    /// WritePage request for the page starting at byte offset `address`
    pub fn write_page(address: u32, page: &[u8]) -> Self {
        Self::new(Opcode::WritePage, address, page)
    }

    /// ExitBootloader request
    pub fn exit() -> Self {
        Self::new(Opcode::ExitBootloader, 0, &[])
    }

    /// Validate and wrap a received frame
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, BootloaderError> {
        if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(BootloaderError::LengthMismatch {
                expected: HEADER_SIZE + CHECKSUM_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[..SYNC.len()] != SYNC {
            return Err(BootloaderError::InvalidSync);
        }

        let frame = Self { bytes };
        let expected_len = HEADER_SIZE + frame.payload_len() + CHECKSUM_SIZE;
        if frame.bytes.len() != expected_len {
            return Err(BootloaderError::LengthMismatch {
                expected: expected_len,
                actual: frame.bytes.len(),
            });
        }

        let end = frame.bytes.len() - CHECKSUM_SIZE;
        let expected = checksum16(&frame.bytes[..end]);
        let actual = frame.checksum();
        if expected != actual {
            return Err(BootloaderError::ChecksumMismatch { expected, actual });
        }
        Ok(frame)
    }

    /// Raw bytes, ready to be written
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total length including header and checksum
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true for a frame built here or accepted by `from_bytes`
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Opcode byte; kept raw so replies with unknown opcodes can be reported
    pub fn opcode(&self) -> u8 {
        self.bytes[OPCODE_OFFSET]
    }

    /// Error reported by the device, `None` on success
    pub fn error_code(&self) -> Option<DeviceErrorCode> {
        DeviceErrorCode::from_byte(self.bytes[ERROR_OFFSET])
    }

    /// Address field; the ReadPageSize reply carries the page size here
    pub fn address(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[ADDRESS_OFFSET..ADDRESS_OFFSET + 4])
    }

    /// Payload length declared in the header
    pub fn payload_len(&self) -> usize {
        LittleEndian::read_u32(&self.bytes[LENGTH_OFFSET..LENGTH_OFFSET + 4]) as usize
    }

    /// Bytes between header and checksum
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..self.bytes.len() - CHECKSUM_SIZE]
    }

    /// Transmitted checksum
    pub fn checksum(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[self.bytes.len() - CHECKSUM_SIZE..])
    }
}

impl fmt::Debug for BootloaderFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootloaderFrame")
            .field("opcode", &format_args!("{:#04x}", self.opcode()))
            .field("error", &self.error_code())
            .field("address", &self.address())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

/// Raw request/reply channel to a device running its bootloader
pub struct BootloaderSession<S> {
    stream: S,
    read_timeout: Duration,
}

impl<S> BootloaderSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `read_timeout` bounds every individual read of a reply
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream,
            read_timeout,
        }
    }

    /// Send `request` and read back a reply of exactly the same length
    pub async fn transact(
        &mut self,
        request: &BootloaderFrame,
    ) -> Result<BootloaderFrame, BootloaderError> {
        trace!("bootloader tx {:?}", request);
        self.stream.write_all(request.as_bytes()).await?;
        self.stream.flush().await?;

        let mut reply = vec![0u8; request.len()];
        let mut filled = 0;
        while filled < reply.len() {
            let read = self.stream.read(&mut reply[filled..]);
            let n = tokio::time::timeout(self.read_timeout, read)
                .await
                .map_err(|_| BootloaderError::Timeout)??;
            if n == 0 {
                return Err(BootloaderError::LengthMismatch {
                    expected: reply.len(),
                    actual: filled,
                });
            }
            filled += n;
        }

        let reply = BootloaderFrame::from_bytes(reply)?;
        trace!("bootloader rx {:?}", reply);
        if reply.opcode() != request.opcode() {
            return Err(BootloaderError::UnexpectedOpcode {
                expected: request.opcode(),
                actual: reply.opcode(),
            });
        }
        if let Some(code) = reply.error_code() {
            return Err(BootloaderError::Device(code));
        }
        Ok(reply)
    }

    /// Ask the bootloader for its page size in bytes
    pub async fn read_page_size(&mut self) -> Result<u32, BootloaderError> {
        let page_size = self
            .transact(&BootloaderFrame::read_page_size())
            .await?
            .address();
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(BootloaderError::InvalidPageSize(page_size));
        }
        debug!("bootloader page size {}", page_size);
        Ok(page_size)
    }

    /// Program one page and wait for its acknowledgement
    pub async fn write_page(&mut self, address: u32, page: &[u8]) -> Result<(), BootloaderError> {
        self.transact(&BootloaderFrame::write_page(address, page))
            .await
            .map(|_| ())
    }

    /// Leave the bootloader; the device reboots into the new firmware
    pub async fn exit(&mut self) -> Result<(), BootloaderError> {
        self.transact(&BootloaderFrame::exit()).await.map(|_| ())
    }

    /// Give back the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_page_layout() {
        let frame = BootloaderFrame::write_page(0x0102_0304, &[0xDE, 0xAD]);
        let bytes = frame.as_bytes();
        assert_eq!(&bytes[..3], &SYNC);
        assert_eq!(bytes[3], 0x00);
        assert_eq!(bytes[4], 0x00);
        assert_eq!(&bytes[5..9], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[9..13], &[2, 0, 0, 0]);
        assert_eq!(frame.payload(), &[0xDE, 0xAD]);
        assert_eq!(frame.len(), 17);
    }

    #[test]
    fn test_checksum_wraps_at_16_bits() {
        let page = vec![0xFFu8; 300];
        let frame = BootloaderFrame::write_page(0, &page);
        let end = frame.len() - CHECKSUM_SIZE;
        let sum: u32 = frame.as_bytes()[..end].iter().map(|&b| b as u32).sum();
        assert!(sum > u16::MAX as u32);
        assert_eq!(frame.checksum(), (sum & 0xFFFF) as u16);
    }

    #[test]
    fn test_from_bytes_rejects_corruption() {
        let mut bytes = BootloaderFrame::exit().as_bytes().to_vec();
        bytes[6] ^= 0x01;
        assert!(matches!(
            BootloaderFrame::from_bytes(bytes),
            Err(BootloaderError::ChecksumMismatch { .. })
        ));

        let mut bytes = BootloaderFrame::exit().as_bytes().to_vec();
        bytes[0] = 0x00;
        assert!(matches!(
            BootloaderFrame::from_bytes(bytes),
            Err(BootloaderError::InvalidSync)
        ));

        let bytes = BootloaderFrame::write_page(0, &[1, 2, 3]).as_bytes()[..16].to_vec();
        assert!(matches!(
            BootloaderFrame::from_bytes(bytes),
            Err(BootloaderError::LengthMismatch { expected: 18, actual: 16 })
        ));
    }

    #[test]
    fn test_device_error_codes() {
        assert_eq!(DeviceErrorCode::from_byte(0), None);
        assert_eq!(DeviceErrorCode::from_byte(2), Some(DeviceErrorCode::InvalidAddress));
        let reply = BootloaderFrame::with_error(0x00, 3, 0, &[]);
        assert_eq!(reply.error_code(), Some(DeviceErrorCode::InvalidDataLength));
    }

    #[test]
    fn test_read_page_size_request_is_15_bytes() {
        let frame = BootloaderFrame::read_page_size();
        let bytes = frame.as_bytes();
        assert_eq!(frame.len(), 15);
        assert_eq!(bytes[3], Opcode::ReadPageSize as u8);
        assert_eq!(frame.payload_len(), 0);

        let sum: u16 = bytes[..13].iter().map(|&b| b as u16).sum();
        assert_eq!(frame.checksum(), sum);
        assert_eq!(&bytes[13..], &sum.to_le_bytes());
    }

    fn session(stream: tokio::io::DuplexStream) -> BootloaderSession<tokio::io::DuplexStream> {
        BootloaderSession::new(stream, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_reply_split_across_reads() {
        let (local, mut remote) = tokio::io::duplex(64);
        let device = tokio::spawn(async move {
            let mut request = [0u8; 15];
            remote.read_exact(&mut request).await.unwrap();
            let reply = BootloaderFrame::with_error(0x66, 0, 128, &[]);
            for chunk in reply.as_bytes().chunks(4) {
                remote.write_all(chunk).await.unwrap();
                remote.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            remote
        });

        let mut session = session(local);
        assert_eq!(session.read_page_size().await.unwrap(), 128);
        let _remote = device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_bootloader_times_out() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut session = session(local);
        assert!(matches!(
            session.exit().await,
            Err(BootloaderError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_short_reply_then_eof() {
        let (local, mut remote) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut request = [0u8; 15];
            remote.read_exact(&mut request).await.unwrap();
            let reply = BootloaderFrame::exit();
            remote.write_all(&reply.as_bytes()[..10]).await.unwrap();
        });

        let mut session = session(local);
        assert!(matches!(
            session.exit().await,
            Err(BootloaderError::LengthMismatch { expected: 15, actual: 10 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_page_size_is_rejected() {
        let (local, mut remote) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut request = [0u8; 15];
            remote.read_exact(&mut request).await.unwrap();
            let reply = BootloaderFrame::with_error(0x66, 0, u32::MAX, &[]);
            remote.write_all(reply.as_bytes()).await.unwrap();
            remote
        });

        let mut session = session(local);
        assert!(matches!(
            session.read_page_size().await,
            Err(BootloaderError::InvalidPageSize(u32::MAX))
        ));
    }
}
