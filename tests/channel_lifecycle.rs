use std::sync::Arc;
use std::time::Duration;

use candle_driver::transport::mock::{MockControl, MockDevice, MockTransport};
use candle_driver::{
    BitTiming, CandleError, ChannelState, Device, DeviceManager, DeviceMode, DeviceOptions,
    Features, ModeFlags,
};

fn open(device: MockDevice) -> (Device, MockControl) {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = Arc::new(MockTransport::new());
    let mock = transport.add(device);
    let manager = DeviceManager::new(transport).with_options(DeviceOptions::default());
    let descriptor = manager.enumerate().unwrap().next().unwrap();
    (manager.open(&descriptor).unwrap(), mock)
}

#[test]
fn test_start_stop_cycle() {
    let (device, mock) = open(MockDevice::new());
    let channel = device.channel(0).unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);

    channel.set_bitrate(500_000).unwrap();
    assert_eq!(channel.bit_timing(), Some(BitTiming::new(1, 12, 2, 1, 6)));
    assert_eq!(channel.bitrate(), Some(500_000));

    channel.start(ModeFlags::NORMAL).unwrap();
    assert!(channel.is_running());
    assert_eq!(channel.mode(), Some(ModeFlags::NORMAL));
    assert_eq!(mock.mode(0), Some(DeviceMode::start(ModeFlags::NORMAL)));
    assert_eq!(mock.pending_rx(), 8);

    channel.stop().unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);
    assert_eq!(mock.mode(0), Some(DeviceMode::reset()));
    assert_eq!(mock.pending_rx(), 0);

    // A stopped channel can be started again
    channel.start(ModeFlags::LOOP_BACK).unwrap();
    assert_eq!(mock.pending_rx(), 8);
    channel.stop().unwrap();
}

#[test]
fn test_operations_rejected_in_wrong_state() {
    let (device, _mock) = open(MockDevice::new());
    let channel = device.channel(0).unwrap();

    assert_eq!(
        channel.stop(),
        Err(CandleError::InvalidState {
            operation: "stop",
            state: "stopped"
        })
    );
    assert!(matches!(
        channel.receive(Some(Duration::ZERO)),
        Err(CandleError::InvalidState { operation: "receive", .. })
    ));

    channel.start(ModeFlags::NORMAL).unwrap();
    assert_eq!(
        channel.start(ModeFlags::NORMAL),
        Err(CandleError::InvalidState {
            operation: "start",
            state: "running"
        })
    );
    assert!(matches!(
        channel.set_bitrate(250_000),
        Err(CandleError::InvalidState { state: "running", .. })
    ));
    assert!(matches!(
        channel.set_bit_timing(BitTiming::new(1, 12, 2, 1, 6)),
        Err(CandleError::InvalidState { .. })
    ));
    channel.stop().unwrap();
}

#[test]
fn test_invalid_timing_sends_nothing() {
    let (device, mock) = open(MockDevice::new());
    let channel = device.channel(0).unwrap();
    let before = mock.control_count();

    // tseg1 = 1 + 20 exceeds the 16 the device allows
    assert!(matches!(
        channel.set_bit_timing(BitTiming::new(1, 20, 2, 1, 6)),
        Err(CandleError::InvalidParameter { name: "tseg1", .. })
    ));
    assert!(matches!(
        channel.set_bit_timing(BitTiming::new(1, 12, 2, 1, 0)),
        Err(CandleError::InvalidParameter { name: "brp", .. })
    ));
    assert!(matches!(
        channel.set_bit_timing(BitTiming::new(1, 12, 2, 3, 6)),
        Err(CandleError::InvalidParameter { name: "sjw", .. })
    ));
    assert!(matches!(
        channel.set_bitrate(0),
        Err(CandleError::InvalidParameter { name: "bitrate", .. })
    ));

    assert_eq!(mock.control_count(), before);
    assert_eq!(channel.bit_timing(), None);
}

#[test]
fn test_unadvertised_features_are_rejected() {
    let (device, mock) = open(MockDevice::new());
    let channel = device.channel(0).unwrap();
    let before = mock.control_count();

    assert_eq!(
        channel.start(ModeFlags::FD),
        Err(CandleError::FeatureNotSupported("FD"))
    );
    assert_eq!(
        channel.start(ModeFlags::ONE_SHOT | ModeFlags::LOOP_BACK),
        Err(CandleError::FeatureNotSupported("ONE_SHOT"))
    );
    assert_eq!(
        channel.set_termination(true),
        Err(CandleError::FeatureNotSupported("TERMINATION"))
    );
    assert_eq!(
        channel.get_state().unwrap_err(),
        CandleError::FeatureNotSupported("GET_STATE")
    );
    assert_eq!(
        channel.set_data_bitrate(2_000_000),
        Err(CandleError::FeatureNotSupported("FD"))
    );
    assert_eq!(mock.control_count(), before);
    assert!(!channel.is_running());
}

#[test]
fn test_fd_channel_configuration() {
    let (device, mock) = open(
        MockDevice::new().with_features(Features::FD | Features::BT_CONST_EXT | Features::LOOP_BACK),
    );
    let channel = device.channel(0).unwrap();
    assert!(channel.supports_fd());
    assert!(channel.capabilities().has_fd_timing());

    channel.set_bitrate(500_000).unwrap();
    channel.set_data_bitrate(2_000_000).unwrap();
    let data = channel.data_bit_timing().unwrap();
    assert_eq!(data.bitrate(48_000_000), 2_000_000);

    channel.start(ModeFlags::FD | ModeFlags::LOOP_BACK).unwrap();
    assert_eq!(
        mock.mode(0),
        Some(DeviceMode::start(ModeFlags::FD | ModeFlags::LOOP_BACK))
    );
    channel.stop().unwrap();
}

#[test]
fn test_fd_without_extended_constants() {
    let (device, _mock) = open(MockDevice::new().with_features(Features::FD));
    let channel = device.channel(0).unwrap();
    assert!(channel.supports_fd());
    assert_eq!(
        channel.set_data_bitrate(2_000_000),
        Err(CandleError::FeatureNotSupported("BT_CONST_EXT"))
    );
}

#[test]
fn test_termination_and_identify() {
    let (device, mock) = open(
        MockDevice::new().with_features(Features::TERMINATION | Features::IDENTIFY),
    );
    let channel = device.channel(0).unwrap();

    assert!(!channel.termination().unwrap());
    channel.set_termination(true).unwrap();
    assert!(channel.termination().unwrap());

    channel.identify(true).unwrap();
    assert!(mock.identifying(0));
    channel.identify(false).unwrap();
    assert!(!mock.identifying(0));

    channel.start(ModeFlags::NORMAL).unwrap();
    assert!(matches!(
        channel.set_termination(false),
        Err(CandleError::InvalidState { .. })
    ));
    // Identify is allowed while running
    channel.identify(true).unwrap();
    channel.stop().unwrap();
}

#[test]
fn test_channels_run_independently() {
    let (device, mock) = open(MockDevice::new().with_channels(2));
    let first = device.channel(0).unwrap();
    let second = device.channel(1).unwrap();

    first.start(ModeFlags::NORMAL).unwrap();
    second.start(ModeFlags::LOOP_BACK).unwrap();
    assert_eq!(mock.pending_rx(), 8);

    // Receive transfers stay primed while another channel runs
    first.stop().unwrap();
    assert!(second.is_running());
    assert_eq!(mock.pending_rx(), 8);

    second.stop().unwrap();
    assert_eq!(mock.pending_rx(), 0);
}

#[test]
fn test_device_reset_stops_running_channels() {
    let (device, mock) = open(MockDevice::new().with_channels(2));
    device.channel(0).unwrap().start(ModeFlags::NORMAL).unwrap();

    device.reset().unwrap();
    assert!(device.channels().iter().all(|c| !c.is_running()));
    assert_eq!(mock.mode(0), Some(DeviceMode::reset()));
    assert_eq!(mock.pending_rx(), 0);
}

#[test]
fn test_close_stops_channels_and_invalidates_handles() {
    let (device, mock) = open(MockDevice::new());
    let channel = device.channel(0).unwrap();
    channel.start(ModeFlags::NORMAL).unwrap();

    device.close().unwrap();
    assert_eq!(mock.mode(0), Some(DeviceMode::reset()));
    assert_eq!(mock.pending_rx(), 0);
    assert!(mock.was_released());
    assert!(!channel.is_running());
    assert_eq!(channel.stop(), Err(CandleError::DeviceClosed));

    drop(device);
    assert_eq!(channel.start(ModeFlags::NORMAL), Err(CandleError::DeviceClosed));
}
