use harp_core::device::Device;
use harp_core::protocol::registers::{self, OperationControl};
use harp_core::protocol::{
    checksum, Frame, MessageType, PayloadValue, ProtocolError, StreamParser, ERROR_FLAG,
};
use harp_core::transport::{open_stream, DeviceOptions, TransportConfig};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

/// Device end of an in-memory link
struct FakeDevice {
    stream: DuplexStream,
    parser: StreamParser,
    received: VecDeque<Frame>,
}

impl FakeDevice {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            parser: StreamParser::new(),
            received: VecDeque::new(),
        }
    }

    async fn next_request(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.received.pop_front() {
                return frame;
            }
            let mut buf = [0u8; 256];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "host closed the link");
            self.received.extend(self.parser.feed(&buf[..n]));
        }
    }

    async fn send(&mut self, frame: &Frame) {
        self.stream.write_all(frame.as_bytes()).await.unwrap();
    }
}

fn reply<T: PayloadValue>(request: &Frame, value: T) -> Frame {
    Frame::with_timestamped_value(
        request.message_type().unwrap(),
        request.address(),
        255,
        0.25,
        value,
    )
}

fn error_reply(frame: &Frame) -> Frame {
    let mut bytes = frame.as_bytes().to_vec();
    bytes[0] |= ERROR_FLAG;
    let last = bytes.len() - 1;
    bytes[last] = checksum(&bytes[..last]);
    Frame::from_bytes(bytes).unwrap()
}

fn connect() -> (Device, FakeDevice) {
    let (local, remote) = duplex(1024);
    let device = Device::from_stream(local, &TransportConfig::default());
    (device, FakeDevice::new(remote))
}

#[tokio::test]
async fn test_concurrent_commands_receive_their_own_replies() {
    let (device, mut fake) = connect();

    let responder = async {
        let first = fake.next_request().await;
        let second = fake.next_request().await;
        // Answer in reverse order
        for request in [second, first] {
            let value = request.address() as u16 * 10;
            fake.send(&reply(&request, value)).await;
        }
    };
    let (a, b, ()) = tokio::join!(device.read::<u16>(32), device.read::<u16>(33), responder);

    assert_eq!(a.unwrap(), 320);
    assert_eq!(b.unwrap(), 330);
}

#[tokio::test]
async fn test_non_matching_frames_are_skipped() {
    let (device, mut fake) = connect();

    let responder = async {
        let request = fake.next_request().await;
        fake.send(&Frame::with_value(MessageType::Event, request.address(), 1u8))
            .await;
        fake.send(&Frame::with_value(MessageType::Read, 99, 2u8)).await;
        fake.send(&reply(&request, 3u8)).await;
    };
    let (value, ()) = tokio::join!(device.read::<u8>(48), responder);
    assert_eq!(value.unwrap(), 3);
}

#[tokio::test]
async fn test_error_reply_fails_the_command() {
    let (device, mut fake) = connect();

    let responder = async {
        let request = fake.next_request().await;
        fake.send(&error_reply(&request)).await;
    };
    let (result, ()) = tokio::join!(device.write(40, 0x0102u16), responder);

    match result {
        Err(ProtocolError::DeviceError {
            address,
            message_type,
            value,
            ..
        }) => {
            assert_eq!(address, 40);
            assert_eq!(message_type, MessageType::Write);
            assert_eq!(value, "258");
        }
        other => panic!("expected a device error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancellation_aborts_only_the_wait() {
    let (device, mut fake) = connect();
    let cancel = CancellationToken::new();

    let canceller = async {
        let request = fake.next_request().await;
        cancel.cancel();
        request
    };
    let (result, request) = tokio::join!(
        device.command(Frame::read_register::<u8>(50), &cancel),
        canceller
    );
    assert!(matches!(result, Err(ProtocolError::Cancelled)));
    assert_eq!(request.address(), 50);

    // A late reply to the cancelled command resolves nothing
    fake.send(&reply(&request, 1u8)).await;

    let responder = async {
        let request = fake.next_request().await;
        fake.send(&reply(&request, 2u8)).await;
    };
    let (value, ()) = tokio::join!(device.read::<u8>(51), responder);
    assert_eq!(value.unwrap(), 2);
}

#[tokio::test]
async fn test_already_cancelled_token_sends_nothing() {
    let (device, _fake) = connect();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = device
        .command(Frame::read_register::<u8>(50), &cancel)
        .await;
    assert!(matches!(result, Err(ProtocolError::Cancelled)));
}

#[tokio::test]
async fn test_command_timeout() {
    let (device, _fake) = connect();
    let result = device
        .command_timeout(Frame::read_register::<u16>(60), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
}

#[tokio::test]
async fn test_pending_command_fails_when_peer_disconnects() {
    let (device, fake) = connect();

    let disconnect = async move {
        let mut fake = fake;
        fake.next_request().await;
    };
    let (result, ()) = tokio::join!(device.read::<u8>(70), disconnect);
    assert!(matches!(result, Err(ProtocolError::Closed)));
    assert!(device.transport().is_closed());
}

#[tokio::test]
async fn test_core_register_helpers() {
    let (device, mut fake) = connect();

    let responder = async {
        let request = fake.next_request().await;
        assert_eq!(request.address(), registers::HARDWARE_VERSION_HIGH);
        fake.send(&reply(&request, 2u8)).await;
        let request = fake.next_request().await;
        assert_eq!(request.address(), registers::HARDWARE_VERSION_LOW);
        fake.send(&reply(&request, 1u8)).await;

        let request = fake.next_request().await;
        assert_eq!(request.address(), registers::DEVICE_NAME);
        let mut name = b"Behavior".to_vec();
        name.resize(registers::DEVICE_NAME_LENGTH, 0);
        let name_reply =
            Frame::with_values(MessageType::Read, registers::DEVICE_NAME, 255, &name).unwrap();
        fake.send(&name_reply).await;
    };
    let device_ref = &device;
    let helpers = async move {
        let version = device_ref.read_hardware_version().await.unwrap();
        let name = device_ref.read_device_name().await.unwrap();
        (version, name)
    };
    let ((version, name), ()) = tokio::join!(helpers, responder);

    assert_eq!(version.to_string(), "2.1");
    assert_eq!(name, "Behavior");
}

#[tokio::test]
async fn test_open_stream_verifies_identity() {
    let (local, remote) = duplex(1024);
    let control = OperationControl::default();

    let device = tokio::spawn(async move {
        let mut fake = FakeDevice::new(remote);
        let request = fake.next_request().await;
        assert!(request.is_match(registers::WHO_AM_I, MessageType::Read));
        fake.send(&reply(&request, 1216u16)).await;

        let request = fake.next_request().await;
        assert!(request.is_match(registers::OPERATION_CONTROL, MessageType::Write));
        assert_eq!(request.value::<u8>().unwrap(), control.to_byte());

        fake.send(&Frame::with_value(MessageType::Event, 33, 7u8)).await;
        fake
    });

    let options = DeviceOptions {
        expected_who_am_i: Some(1216),
        operation_control: Some(control),
        ..DeviceOptions::default()
    };
    let (writer, mut frames) = open_stream(local, &TransportConfig::default(), &options)
        .await
        .unwrap();

    let event = frames.next().await.unwrap().unwrap();
    assert!(event.is_match(33, MessageType::Event));
    let _fake = device.await.unwrap();

    writer.close();
    assert!(frames.next().await.is_none());
}

#[tokio::test]
async fn test_open_stream_rejects_unexpected_device() {
    let (local, remote) = duplex(1024);

    let device = tokio::spawn(async move {
        let mut fake = FakeDevice::new(remote);
        let request = fake.next_request().await;
        fake.send(&reply(&request, 2048u16)).await;
        fake
    });

    let options = DeviceOptions {
        expected_who_am_i: Some(1216),
        ..DeviceOptions::default()
    };
    let result = open_stream(local, &TransportConfig::default(), &options).await;
    assert!(matches!(
        result,
        Err(ProtocolError::UnexpectedDevice {
            expected: 1216,
            actual: 2048
        })
    ));
    let _fake = device.await.unwrap();
}

#[tokio::test]
async fn test_attached_device_leaves_transport_open() {
    let (local, remote) = duplex(1024);
    let (writer, _frames) =
        open_stream(local, &TransportConfig::default(), &DeviceOptions::default())
            .await
            .unwrap();
    let mut fake = FakeDevice::new(remote);

    let device = Device::attach(writer.transport().clone(), true);
    let responder = async {
        let request = fake.next_request().await;
        fake.send(&reply(&request, 1216u16)).await;
    };
    let (who_am_i, ()) = tokio::join!(device.read_who_am_i(), responder);
    assert_eq!(who_am_i.unwrap(), 1216);

    drop(device);
    assert!(!writer.transport().is_closed());
    writer.write(&Frame::write(32, 1u8)).await.unwrap();
    assert_eq!(fake.next_request().await.address(), 32);
}

#[tokio::test]
async fn test_attached_device_fails_on_error_reply() {
    // The default error policy raises error replies before the command layer sees them
    let (local, remote) = duplex(1024);
    let (writer, _frames) =
        open_stream(local, &TransportConfig::default(), &DeviceOptions::default())
            .await
            .unwrap();
    let mut fake = FakeDevice::new(remote);
    let device = Device::attach(writer.transport().clone(), true);

    let responder = async {
        let request = fake.next_request().await;
        fake.send(&error_reply(&request)).await;
    };
    let (result, ()) = tokio::join!(
        tokio::time::timeout(Duration::from_millis(500), device.write(40, 7u8)),
        responder
    );

    match result.expect("command resolved") {
        Err(ProtocolError::DeviceError {
            address,
            message_type,
            value,
            ..
        }) => {
            assert_eq!(address, 40);
            assert_eq!(message_type, MessageType::Write);
            assert_eq!(value, "7");
        }
        other => panic!("expected a device error, got {:?}", other),
    }

    // The dispatcher keeps serving commands afterwards
    let responder = async {
        let request = fake.next_request().await;
        fake.send(&reply(&request, 5u8)).await;
    };
    let (value, ()) = tokio::join!(device.read::<u8>(41), responder);
    assert_eq!(value.unwrap(), 5);
}

#[tokio::test]
async fn test_raised_error_reply_does_not_end_the_stream() {
    let (local, remote) = duplex(1024);
    let (writer, mut frames) =
        open_stream(local, &TransportConfig::default(), &DeviceOptions::default())
            .await
            .unwrap();
    let mut fake = FakeDevice::new(remote);

    writer.write(&Frame::write(32, 1500u16)).await.unwrap();
    let request = fake.next_request().await;
    fake.send(&error_reply(&request)).await;
    fake.send(&Frame::with_value(MessageType::Event, 33, 9u8)).await;

    match frames.next().await {
        Some(Err(ProtocolError::DeviceError { address, value, .. })) => {
            assert_eq!(address, 32);
            assert_eq!(value, "1500");
        }
        other => panic!("expected a raised device error, got {:?}", other),
    }
    let event = frames.next().await.unwrap().unwrap();
    assert!(event.is_match(33, MessageType::Event));
    assert_eq!(event.value::<u8>().unwrap(), 9);
}
