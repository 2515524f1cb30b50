//! In-memory gs_usb device
//!
//! [`MockTransport`] answers control requests the way firmware does and
//! parks submitted bulk transfers until the test drives them through a
//! [`MockControl`]: [`MockControl::deliver`] completes a pending receive
//! with the given bytes, [`MockControl::complete_tx`] completes queued
//! transmits. Completions run on the calling thread.
//!
//! ```
//! use std::sync::Arc;
//! use candle_driver::transport::mock::{MockDevice, MockTransport};
//! use candle_driver::DeviceManager;
//!
//! let transport = Arc::new(MockTransport::new());
//! let control = transport.add(MockDevice::new().with_channels(2));
//! let manager = DeviceManager::new(transport);
//! let descriptor = manager.enumerate().unwrap().next().unwrap();
//! let device = manager.open(&descriptor).unwrap();
//! assert_eq!(device.info().channel_count, 2);
//! assert!(control.is_claimed());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    Completion, CompletionSink, ControlSetup, DeviceAvailability, DeviceDescriptor, Transfer,
    TransferKind, UsbHandle, UsbTransport,
};
use crate::constants::{
    GS_CAN_IDENTIFY_ON, GS_USB_BREQ_BT_CONST, GS_USB_BREQ_BT_CONST_EXT, GS_USB_BREQ_DEVICE_CONFIG,
    GS_USB_BREQ_GET_STATE, GS_USB_BREQ_GET_TERMINATION, GS_USB_BREQ_GET_USER_ID,
    GS_USB_BREQ_IDENTIFY, GS_USB_BREQ_MODE, GS_USB_BREQ_SET_TERMINATION,
    GS_USB_BREQ_SET_USER_ID, GS_USB_BREQ_TIMESTAMP, GS_USB_ID_PRODUCT, GS_USB_ID_VENDOR,
};
use crate::error::TransportError;
use crate::frame::HostFrame;
use crate::structures::{
    le_u32, BitTimingConst, CanState, DeviceConfig, DeviceMode, DeviceState, Features,
    TimingLimits,
};

type Pending = (Transfer, Arc<dyn CompletionSink>);

/// Description of a simulated adapter
#[derive(Debug, Clone)]
pub struct MockDevice {
    descriptor: DeviceDescriptor,
    channels: u8,
    features: Features,
    clock_hz: u32,
    sw_version: u32,
    hw_version: u32,
    nominal: TimingLimits,
    data: TimingLimits,
}

impl MockDevice {
    /// A single-channel classic CAN adapter at 1d50:606f with a 48 MHz clock
    pub fn new() -> Self {
        Self {
            descriptor: DeviceDescriptor {
                vendor_id: GS_USB_ID_VENDOR,
                product_id: GS_USB_ID_PRODUCT,
                bus: 1,
                address: 1,
                port_numbers: vec![1],
                manufacturer: Some("bytewerk".into()),
                product: Some("candleLight USB to CAN adapter".into()),
                serial: Some("000000000001".into()),
            },
            channels: 1,
            features: Features::LISTEN_ONLY
                | Features::LOOP_BACK
                | Features::HW_TIMESTAMP
                | Features::IDENTIFY,
            clock_hz: 48_000_000,
            sw_version: 2,
            hw_version: 1,
            nominal: TimingLimits {
                tseg1_min: 1,
                tseg1_max: 16,
                tseg2_min: 1,
                tseg2_max: 8,
                sjw_max: 4,
                brp_min: 1,
                brp_max: 1024,
                brp_inc: 1,
            },
            data: TimingLimits {
                tseg1_min: 1,
                tseg1_max: 16,
                tseg2_min: 1,
                tseg2_max: 8,
                sjw_max: 4,
                brp_min: 1,
                brp_max: 32,
                brp_inc: 1,
            },
        }
    }

    pub fn with_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.descriptor.vendor_id = vendor_id;
        self.descriptor.product_id = product_id;
        self
    }

    pub fn with_location(mut self, bus: u8, address: u8) -> Self {
        self.descriptor.bus = bus;
        self.descriptor.address = address;
        self
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.descriptor.serial = Some(serial.to_string());
        self
    }

    /// Number of CAN channels, at least one
    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels.max(1);
        self
    }

    /// Advertised feature bits
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_clock(mut self, clock_hz: u32) -> Self {
        self.clock_hz = clock_hz;
        self
    }

    pub fn with_versions(mut self, sw_version: u32, hw_version: u32) -> Self {
        self.sw_version = sw_version;
        self.hw_version = hw_version;
        self
    }

    pub fn with_timing_limits(mut self, nominal: TimingLimits, data: TimingLimits) -> Self {
        self.nominal = nominal;
        self.data = data;
        self
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn capability(&self, extended: bool) -> BitTimingConst {
        BitTimingConst {
            features: self.features,
            fclk_can: self.clock_hz,
            nominal: self.nominal,
            data: extended.then_some(self.data),
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// A control transfer seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub setup: ControlSetup,
    /// Payload for OUT requests, empty for IN requests
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    rx: VecDeque<Pending>,
    tx: VecDeque<Pending>,
    max_pending_tx: usize,
    sent: Vec<Vec<u8>>,
    controls: Vec<ControlRecord>,
    responses: HashMap<u8, Vec<u8>>,
    failures: HashMap<u8, TransportError>,
    modes: HashMap<u16, DeviceMode>,
    termination: HashMap<u16, u32>,
    identify: HashMap<u16, bool>,
    can_state: Option<DeviceState>,
    user_id: u32,
}

struct MockShared {
    device: MockDevice,
    state: Mutex<MockState>,
    claimed: AtomicBool,
    released: AtomicBool,
    busy: AtomicBool,
    unplugged: AtomicBool,
    timestamp: AtomicU32,
}

/// Test-side view of a simulated adapter
#[derive(Clone)]
pub struct MockControl {
    shared: Arc<MockShared>,
}

impl MockControl {
    /// Complete the oldest pending receive with `bytes`
    ///
    /// Returns `false` when no receive transfer is pending.
    pub fn deliver(&self, bytes: &[u8]) -> bool {
        let pending = self.shared.state.lock().rx.pop_front();
        let Some((mut transfer, sink)) = pending else {
            return false;
        };

        let len = bytes.len().min(transfer.buffer.len());
        transfer.buffer[..len].copy_from_slice(&bytes[..len]);
        let status = if bytes.len() > transfer.buffer.len() {
            Err(TransportError::Overflow)
        } else {
            Ok(())
        };
        sink.on_complete(Completion {
            transfer,
            actual_len: len,
            status,
        });
        true
    }

    /// Encode and deliver a host frame
    pub fn deliver_frame(&self, frame: &HostFrame) -> bool {
        self.deliver(&frame.encode())
    }

    /// Complete the oldest pending receive with an error
    pub fn fail_rx(&self, error: TransportError) -> bool {
        let pending = self.shared.state.lock().rx.pop_front();
        let Some((transfer, sink)) = pending else {
            return false;
        };
        sink.on_complete(Completion {
            transfer,
            actual_len: 0,
            status: Err(error),
        });
        true
    }

    /// Complete up to `count` queued transmits successfully
    pub fn complete_tx(&self, count: usize) -> usize {
        self.finish_tx(count, None)
    }

    /// Complete up to `count` queued transmits with `error`
    pub fn fail_tx(&self, count: usize, error: TransportError) -> usize {
        self.finish_tx(count, Some(error))
    }

    fn finish_tx(&self, count: usize, error: Option<TransportError>) -> usize {
        let batch: Vec<Pending> = {
            let mut state = self.shared.state.lock();
            let n = count.min(state.tx.len());
            state.tx.drain(..n).collect()
        };
        let done = batch.len();
        for (transfer, sink) in batch {
            let (actual_len, status) = match &error {
                None => (transfer.buffer.len(), Ok(())),
                Some(e) => (0, Err(e.clone())),
            };
            sink.on_complete(Completion {
                transfer,
                actual_len,
                status,
            });
        }
        done
    }

    /// Receive transfers waiting for data
    pub fn pending_rx(&self) -> usize {
        self.shared.state.lock().rx.len()
    }

    /// Transmit transfers not yet completed
    pub fn pending_tx(&self) -> usize {
        self.shared.state.lock().tx.len()
    }

    /// Highest number of transmits ever pending at once
    pub fn max_pending_tx(&self) -> usize {
        self.shared.state.lock().max_pending_tx
    }

    /// Bytes of every submitted transmit, in submission order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().sent.clone()
    }

    /// Every control transfer so far
    pub fn control_requests(&self) -> Vec<ControlRecord> {
        self.shared.state.lock().controls.clone()
    }

    pub fn control_count(&self) -> usize {
        self.shared.state.lock().controls.len()
    }

    /// Reply to IN `request` with `bytes` instead of the simulated answer
    pub fn set_response(&self, request: u8, bytes: &[u8]) {
        self.shared
            .state
            .lock()
            .responses
            .insert(request, bytes.to_vec());
    }

    /// Fail every control transfer for `request`
    pub fn set_failure(&self, request: u8, error: TransportError) {
        self.shared.state.lock().failures.insert(request, error);
    }

    pub fn clear_failure(&self, request: u8) {
        self.shared.state.lock().failures.remove(&request);
    }

    /// State reported by GET_STATE
    pub fn set_can_state(&self, state: CanState, rxerr: u32, txerr: u32) {
        self.shared.state.lock().can_state = Some(DeviceState {
            state,
            rxerr,
            txerr,
        });
    }

    pub fn set_timestamp(&self, timestamp_us: u32) {
        self.shared.timestamp.store(timestamp_us, Ordering::Release);
    }

    /// Last mode set on `channel`
    pub fn mode(&self, channel: u16) -> Option<DeviceMode> {
        self.shared.state.lock().modes.get(&channel).copied()
    }

    /// Whether the identify LED of `channel` is on
    pub fn identifying(&self, channel: u16) -> bool {
        self.shared
            .state
            .lock()
            .identify
            .get(&channel)
            .copied()
            .unwrap_or(false)
    }

    /// Make the interface appear claimed by another process
    pub fn set_busy(&self, busy: bool) {
        self.shared.busy.store(busy, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.shared.claimed.load(Ordering::Acquire)
    }

    /// Whether an opened handle has since been dropped
    pub fn was_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Detach the device: pending transfers fail and later I/O errors out
    pub fn unplug(&self) {
        self.shared.unplugged.store(true, Ordering::Release);
        let pending: Vec<Pending> = {
            let mut state = self.shared.state.lock();
            let mut all: Vec<Pending> = state.rx.drain(..).collect();
            all.extend(state.tx.drain(..));
            all
        };
        for (transfer, sink) in pending {
            sink.on_complete(Completion {
                transfer,
                actual_len: 0,
                status: Err(TransportError::Disconnected),
            });
        }
    }
}

/// Transport over simulated devices
#[derive(Default)]
pub struct MockTransport {
    devices: Mutex<Vec<Arc<MockShared>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device
    pub fn add(&self, device: MockDevice) -> MockControl {
        let shared = Arc::new(MockShared {
            device,
            state: Mutex::new(MockState::default()),
            claimed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            unplugged: AtomicBool::new(false),
            timestamp: AtomicU32::new(0),
        });
        self.devices.lock().push(Arc::clone(&shared));
        MockControl { shared }
    }

    fn find(&self, descriptor: &DeviceDescriptor) -> Option<Arc<MockShared>> {
        self.devices
            .lock()
            .iter()
            .find(|d| {
                let desc = &d.device.descriptor;
                desc.bus == descriptor.bus
                    && desc.address == descriptor.address
                    && !d.unplugged.load(Ordering::Acquire)
            })
            .cloned()
    }
}

impl UsbTransport for MockTransport {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|d| !d.unplugged.load(Ordering::Acquire))
            .map(|d| d.device.descriptor.clone())
            .collect())
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        _interface: u8,
    ) -> Result<Box<dyn UsbHandle>, TransportError> {
        let shared = self.find(descriptor).ok_or(TransportError::NotFound)?;

        if shared.busy.load(Ordering::Acquire) {
            return Err(TransportError::Busy);
        }
        if shared.claimed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Busy);
        }
        shared.released.store(false, Ordering::Release);
        Ok(Box::new(MockHandle { shared }))
    }

    fn availability(
        &self,
        descriptor: &DeviceDescriptor,
        _interface: u8,
    ) -> Result<DeviceAvailability, TransportError> {
        let shared = self.find(descriptor).ok_or(TransportError::NotFound)?;
        if shared.busy.load(Ordering::Acquire) || shared.claimed.load(Ordering::Acquire) {
            Ok(DeviceAvailability::InUse)
        } else {
            Ok(DeviceAvailability::Available)
        }
    }
}

struct MockHandle {
    shared: Arc<MockShared>,
}

impl MockHandle {
    fn check(&self, request: u8) -> Result<(), TransportError> {
        if self.shared.unplugged.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        match self.shared.state.lock().failures.get(&request) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn answer(&self, setup: &ControlSetup) -> Result<Vec<u8>, TransportError> {
        let device = &self.shared.device;
        let channel = setup.value;
        let state = self.shared.state.lock();

        if let Some(bytes) = state.responses.get(&setup.request) {
            return Ok(bytes.clone());
        }

        let in_range = channel < u16::from(device.channels);
        let bytes = match setup.request {
            GS_USB_BREQ_DEVICE_CONFIG => DeviceConfig {
                icount: device.channels - 1,
                sw_version: device.sw_version,
                hw_version: device.hw_version,
            }
            .encode()
            .to_vec(),
            GS_USB_BREQ_BT_CONST if in_range => device.capability(false).encode(),
            GS_USB_BREQ_BT_CONST_EXT if in_range && device.features.contains(Features::BT_CONST_EXT) => {
                device.capability(true).encode()
            }
            GS_USB_BREQ_GET_TERMINATION
                if in_range && device.features.contains(Features::TERMINATION) =>
            {
                state
                    .termination
                    .get(&channel)
                    .copied()
                    .unwrap_or(0)
                    .to_le_bytes()
                    .to_vec()
            }
            GS_USB_BREQ_GET_STATE if in_range && device.features.contains(Features::GET_STATE) => {
                let reported = state.can_state.unwrap_or(DeviceState {
                    state: CanState::ErrorActive,
                    rxerr: 0,
                    txerr: 0,
                });
                reported.encode().to_vec()
            }
            GS_USB_BREQ_TIMESTAMP => self
                .shared
                .timestamp
                .load(Ordering::Acquire)
                .to_le_bytes()
                .to_vec(),
            GS_USB_BREQ_GET_USER_ID if device.features.contains(Features::USER_ID) => {
                state.user_id.to_le_bytes().to_vec()
            }
            _ => return Err(TransportError::Stall),
        };
        Ok(bytes)
    }
}

impl UsbHandle for MockHandle {
    fn control_in(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check(setup.request)?;
        self.shared.state.lock().controls.push(ControlRecord {
            setup,
            data: Vec::new(),
        });

        let bytes = self.answer(&setup)?;
        let len = bytes.len().min(data.len());
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check(setup.request)?;
        let mut state = self.shared.state.lock();
        state.controls.push(ControlRecord {
            setup,
            data: data.to_vec(),
        });

        let channel = setup.value;
        match setup.request {
            GS_USB_BREQ_MODE if data.len() == DeviceMode::SIZE => {
                if let Ok(mode) = DeviceMode::decode(data) {
                    state.modes.insert(channel, mode);
                }
            }
            GS_USB_BREQ_SET_TERMINATION if data.len() == 4 => {
                state.termination.insert(channel, le_u32(data, 0));
            }
            GS_USB_BREQ_IDENTIFY if data.len() == 4 => {
                state
                    .identify
                    .insert(channel, le_u32(data, 0) == GS_CAN_IDENTIFY_ON);
            }
            GS_USB_BREQ_SET_USER_ID if data.len() == 4 => {
                state.user_id = le_u32(data, 0);
            }
            _ => {}
        }
        Ok(data.len())
    }

    fn submit(
        &self,
        transfer: Transfer,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(), TransportError> {
        if self.shared.unplugged.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        let mut state = self.shared.state.lock();
        match transfer.kind {
            TransferKind::Receive => state.rx.push_back((transfer, sink)),
            TransferKind::Transmit { .. } => {
                state.sent.push(transfer.buffer.clone());
                state.tx.push_back((transfer, sink));
                state.max_pending_tx = state.max_pending_tx.max(state.tx.len());
            }
        }
        Ok(())
    }

    fn cancel_all(&self) {
        let pending: Vec<Pending> = {
            let mut state = self.shared.state.lock();
            let mut all: Vec<Pending> = state.rx.drain(..).collect();
            all.extend(state.tx.drain(..));
            all
        };
        for (transfer, sink) in pending {
            sink.on_complete(Completion {
                transfer,
                actual_len: 0,
                status: Err(TransportError::Cancelled),
            });
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.shared.claimed.store(false, Ordering::Release);
        self.shared.released.store(true, Ordering::Release);
    }
}
