//! Device discovery, opening and lifecycle
//!
//! [`DeviceManager`] enumerates and opens adapters through a
//! [`UsbTransport`]. An open [`Device`] owns the claimed USB handle and the
//! receive transfers shared by all of its channels: gs_usb adapters have a
//! single bulk IN endpoint, and the `channel` byte of each host frame routes
//! it to its [`Channel`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::channel::{Channel, ChannelShared};
use crate::config::DeviceOptions;
use crate::constants::{
    GS_CAN_FLAG_FD, GS_USB_ENDPOINT_IN, GS_USB_FRAME_HEADER_SIZE, GS_USB_KNOWN_IDS,
};
use crate::control::Control;
use crate::error::{CandleError, Result, TransportError};
use crate::fifo::BufferPool;
use crate::frame::HostFrame;
use crate::structures::{BitTimingConst, DeviceMode, Features};
use crate::transport::libusb::RusbTransport;
use crate::transport::{
    Completion, CompletionSink, DeviceAvailability, DeviceDescriptor, Transfer, TransferKind,
    UsbHandle, UsbTransport,
};

// ============================================================================
// Device information
// ============================================================================

/// Identity and capabilities read when the device was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Firmware version (tenths)
    pub sw_version: u32,
    /// Hardware version (tenths)
    pub hw_version: u32,
    pub channel_count: usize,
    /// Features of channel 0
    pub features: Features,
    /// CAN clock of channel 0 in Hz
    pub clock_hz: u32,
}

impl DeviceInfo {
    /// Get firmware version as a float
    pub fn firmware_version(&self) -> f32 {
        self.sw_version as f32 / 10.0
    }

    /// Get hardware version as a float
    pub fn hardware_version(&self) -> f32 {
        self.hw_version as f32 / 10.0
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} channel(s), hw: {:.1}, fw: {:.1}, clock: {} Hz, features: {}",
            self.channel_count,
            self.hardware_version(),
            self.firmware_version(),
            self.clock_hz,
            self.features.names().join(" ")
        )
    }
}

/// Snapshot of device-wide receive counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Received transfers that did not decode as a host frame
    pub decode_errors: u64,
    /// Receive transfers that completed with an error
    pub rx_transfer_errors: u64,
    /// Frames naming a channel the device does not have
    pub unrouted_frames: u64,
}

// ============================================================================
// In-flight accounting
// ============================================================================

/// Counter of submitted transfers that can be waited on until it drains
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Take a slot unless `limit` are already taken
    pub(crate) fn try_acquire(&self, limit: usize) -> bool {
        let mut count = self.count.lock();
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    pub(crate) fn acquire(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn release(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until no slot is taken; `false` on timeout
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

// ============================================================================
// Shared device state
// ============================================================================

#[derive(Default)]
struct Counters {
    decode_errors: AtomicU64,
    rx_transfer_errors: AtomicU64,
    unrouted_frames: AtomicU64,
}

/// State shared by a [`Device`], its channels and in-flight transfers
pub(crate) struct DeviceShared {
    me: Weak<DeviceShared>,
    descriptor: DeviceDescriptor,
    info: DeviceInfo,
    options: DeviceOptions,
    /// `None` once closed
    handle: RwLock<Option<Box<dyn UsbHandle>>>,
    closed: AtomicBool,
    gone: AtomicBool,
    /// Serialises channel start/stop and close
    lifecycle: Mutex<()>,
    channels: Vec<Arc<ChannelShared>>,
    /// Whether receive completions are resubmitted
    rx_enabled: Mutex<bool>,
    rx_in_flight: InFlight,
    rx_pool: Mutex<BufferPool>,
    counters: Counters,
}

impl DeviceShared {
    pub(crate) fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub(crate) fn lifecycle(&self) -> &Mutex<()> {
        &self.lifecycle
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    pub(crate) fn any_running(&self) -> bool {
        self.channels.iter().any(|c| c.is_running())
    }

    fn sink(&self) -> Result<Arc<dyn CompletionSink>> {
        let me: Arc<dyn CompletionSink> = self.me.upgrade().ok_or(CandleError::DeviceClosed)?;
        Ok(me)
    }

    fn mark_gone(&self) {
        if !self.gone.swap(true, Ordering::AcqRel) {
            warn!("{} disconnected", self.descriptor);
            for channel in &self.channels {
                channel.wake_receivers();
            }
        }
    }

    /// Run control requests against the open handle
    pub(crate) fn with_control<T>(&self, f: impl FnOnce(&Control<'_>) -> Result<T>) -> Result<T> {
        let guard = self.handle.read_recursive();
        let handle = guard.as_ref().ok_or(CandleError::DeviceClosed)?;
        let control = Control::new(
            handle.as_ref(),
            self.options.interface,
            self.options.control_timeout,
        );
        let result = f(&control);
        if let Err(CandleError::Transport(TransportError::Disconnected)) = &result {
            self.mark_gone();
        }
        result
    }

    /// Queue a bulk transfer with this device as its completion sink
    pub(crate) fn submit(&self, transfer: Transfer) -> Result<()> {
        let sink = self.sink()?;
        let guard = self.handle.read_recursive();
        let handle = guard.as_ref().ok_or(CandleError::DeviceClosed)?;
        if let Err(e) = handle.submit(transfer, sink) {
            if e == TransportError::Disconnected {
                self.mark_gone();
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Prime the receive transfers unless already running
    pub(crate) fn start_rx(&self) -> Result<()> {
        let mut enabled = self.rx_enabled.lock();
        if *enabled {
            return Ok(());
        }
        *enabled = true;

        for _ in 0..self.options.rx_transfers {
            let buffer = self.rx_pool.lock().take();
            self.rx_in_flight.acquire();
            if let Err(e) = self.submit(Transfer::receive(GS_USB_ENDPOINT_IN, buffer)) {
                self.rx_in_flight.release();
                *enabled = false;
                drop(enabled);
                self.cancel_and_drain();
                return Err(e);
            }
        }

        debug!(
            "{}: {} receive transfers primed",
            self.descriptor, self.options.rx_transfers
        );
        Ok(())
    }

    /// Cancel and drain the receive transfers
    pub(crate) fn stop_rx(&self) {
        {
            let mut enabled = self.rx_enabled.lock();
            if !*enabled {
                return;
            }
            *enabled = false;
        }
        self.cancel_and_drain();
    }

    fn cancel_and_drain(&self) {
        if let Some(handle) = self.handle.read_recursive().as_ref() {
            handle.cancel_all();
        }

        let timeout = self.options.drain_timeout;
        if !self.rx_in_flight.wait_idle(timeout) {
            warn!(
                "{}: {} receive transfers still pending after {:?}",
                self.descriptor,
                self.rx_in_flight.count(),
                timeout
            );
        }
        for channel in &self.channels {
            if !channel.wait_tx_idle(timeout) {
                warn!(
                    "{}: channel {} transmits still pending after {:?}",
                    self.descriptor,
                    channel.index(),
                    timeout
                );
            }
        }
    }

    fn retire(&self, buffer: Vec<u8>) {
        self.rx_pool.lock().give(buffer);
        self.rx_in_flight.release();
    }

    fn resubmit(&self, buffer: Vec<u8>) {
        let enabled = self.rx_enabled.lock();
        if !*enabled || self.is_closed() {
            drop(enabled);
            self.retire(buffer);
            return;
        }

        let mut buffer = buffer;
        buffer.resize(self.options.rx_buffer_size, 0);
        if let Err(e) = self.submit(Transfer::receive(GS_USB_ENDPOINT_IN, buffer)) {
            warn!("{}: failed to resubmit receive transfer: {}", self.descriptor, e);
            self.rx_in_flight.release();
        }
    }

    fn receive_complete(&self, completion: Completion) {
        match &completion.status {
            Ok(()) => self.route(completion.data()),
            Err(TransportError::Cancelled) => {
                self.retire(completion.transfer.buffer);
                return;
            }
            Err(TransportError::Disconnected) => {
                self.counters.rx_transfer_errors.fetch_add(1, Ordering::Relaxed);
                self.retire(completion.transfer.buffer);
                self.mark_gone();
                return;
            }
            Err(TransportError::Stall) => {
                self.counters.rx_transfer_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{}: bulk IN endpoint stalled", self.descriptor);
                self.retire(completion.transfer.buffer);
                return;
            }
            Err(e) => {
                self.counters.rx_transfer_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{}: receive transfer failed: {}", self.descriptor, e);
            }
        }
        self.resubmit(completion.transfer.buffer);
    }

    /// Decode one received transfer and queue it on its channel
    fn route(&self, data: &[u8]) {
        let mut data = data;
        if data.len() >= GS_USB_FRAME_HEADER_SIZE {
            let fd = data[10] & GS_CAN_FLAG_FD != 0;
            let padded = self
                .channels
                .get(usize::from(data[9]))
                .and_then(|c| c.padded_frame_len(fd));
            if let Some(len) = padded {
                if data.len() > len {
                    data = &data[..len];
                }
            }
        }

        match HostFrame::decode(data) {
            Ok(host) => match self.channels.get(usize::from(host.channel)) {
                Some(channel) => {
                    trace!("RX ch{} {}", host.channel, host.frame);
                    channel.deliver(host.frame);
                }
                None => {
                    self.counters.unrouted_frames.fetch_add(1, Ordering::Relaxed);
                    debug!("Dropping frame for unknown channel {}", host.channel);
                }
            },
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping {}-byte transfer: {}", data.len(), e);
            }
        }
    }

    fn transmit_complete(
        &self,
        channel: u8,
        echo_id: u32,
        status: &std::result::Result<(), TransportError>,
    ) {
        if let Some(channel) = self.channels.get(usize::from(channel)) {
            channel.transmit_complete(echo_id, status);
        }
        if let Err(TransportError::Disconnected) = status {
            self.mark_gone();
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _lifecycle = self.lifecycle.lock();

        for channel in &self.channels {
            channel.force_stop();
        }

        let mut result = Ok(());
        if !self.is_gone() {
            for channel in &self.channels {
                let index = u16::from(channel.index());
                if let Err(e) = self.with_control(|c| c.set_mode(index, &DeviceMode::reset())) {
                    warn!("{}: failed to reset channel {}: {}", self.descriptor, index, e);
                    let disconnected =
                        matches!(e, CandleError::Transport(TransportError::Disconnected));
                    if result.is_ok() && !disconnected {
                        result = Err(e);
                    }
                }
            }
        }

        *self.rx_enabled.lock() = false;
        self.cancel_and_drain();
        for channel in &self.channels {
            channel.finish_stop();
        }

        let handle = self.handle.write().take();
        drop(handle);
        debug!("Closed {}", self.descriptor);
        result
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            rx_transfer_errors: self.counters.rx_transfer_errors.load(Ordering::Relaxed),
            unrouted_frames: self.counters.unrouted_frames.load(Ordering::Relaxed),
        }
    }
}

impl CompletionSink for DeviceShared {
    fn on_complete(&self, completion: Completion) {
        match completion.transfer.kind {
            TransferKind::Receive => self.receive_complete(completion),
            TransferKind::Transmit { channel, echo_id } => {
                self.transmit_complete(channel, echo_id, &completion.status)
            }
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// An open gs_usb adapter
///
/// Dropping the device closes it.
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CandleError::DeviceClosed);
        }
        Ok(())
    }

    fn require(&self, feature: Features, name: &'static str) -> Result<()> {
        if !self.shared.info.features.contains(feature) {
            return Err(CandleError::FeatureNotSupported(name));
        }
        Ok(())
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Get a handle to channel `index`
    pub fn channel(&self, index: u8) -> Result<Channel> {
        self.ensure_open()?;
        let shared = self
            .shared
            .channels
            .get(usize::from(index))
            .ok_or(CandleError::InvalidChannel {
                channel: index,
                count: u8::try_from(self.channel_count()).unwrap_or(u8::MAX),
            })?;
        Ok(Channel::new(Arc::downgrade(&self.shared), Arc::clone(shared)))
    }

    /// Handles to every channel
    pub fn channels(&self) -> Vec<Channel> {
        self.shared
            .channels
            .iter()
            .map(|c| Channel::new(Arc::downgrade(&self.shared), Arc::clone(c)))
            .collect()
    }

    /// Current device timestamp in microseconds
    pub fn timestamp_us(&self) -> Result<u32> {
        self.ensure_open()?;
        self.require(Features::HW_TIMESTAMP, "HW_TIMESTAMP")?;
        self.shared.with_control(|c| c.get_timestamp())
    }

    pub fn user_id(&self) -> Result<u32> {
        self.ensure_open()?;
        self.require(Features::USER_ID, "USER_ID")?;
        self.shared.with_control(|c| c.get_user_id())
    }

    pub fn set_user_id(&self, user_id: u32) -> Result<()> {
        self.ensure_open()?;
        self.require(Features::USER_ID, "USER_ID")?;
        self.shared.with_control(|c| c.set_user_id(user_id))
    }

    pub fn stats(&self) -> DeviceStats {
        self.shared.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop every running channel
    pub fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        for channel in self.channels() {
            if !channel.is_running() {
                continue;
            }
            match channel.stop() {
                Ok(()) | Err(CandleError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stop all channels, cancel transfers and release the interface
    ///
    /// Idempotent. Channel handles fail with `DeviceClosed` afterwards.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("descriptor", &self.shared.descriptor)
            .field("info", &self.shared.info)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shared.descriptor)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Error closing {}: {}", self.shared.descriptor, e);
        }
    }
}

// ============================================================================
// Device manager
// ============================================================================

/// Lazily filtered list of enumerated devices
#[derive(Debug, Clone)]
pub struct Enumeration {
    devices: Vec<DeviceDescriptor>,
    ids: Vec<(u16, u16)>,
    position: usize,
}

impl Enumeration {
    /// Restart iteration from the first device
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

impl Iterator for Enumeration {
    type Item = DeviceDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(device) = self.devices.get(self.position) {
            self.position += 1;
            if device.matches(&self.ids) {
                return Some(device.clone());
            }
        }
        None
    }
}

/// Entry point: finds and opens gs_usb adapters
pub struct DeviceManager {
    transport: Arc<dyn UsbTransport>,
    ids: Vec<(u16, u16)>,
    options: DeviceOptions,
}

impl DeviceManager {
    /// Manager over `transport` matching the known gs_usb devices
    pub fn new(transport: Arc<dyn UsbTransport>) -> Self {
        Self {
            transport,
            ids: GS_USB_KNOWN_IDS.to_vec(),
            options: DeviceOptions::default(),
        }
    }

    /// Manager over libusb
    pub fn rusb() -> Self {
        Self::new(Arc::new(RusbTransport::new()))
    }

    /// Match only these `(vendor_id, product_id)` pairs
    pub fn with_ids(mut self, ids: &[(u16, u16)]) -> Self {
        self.ids = ids.to_vec();
        self
    }

    pub fn with_options(mut self, options: DeviceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Scan the bus for matching devices
    pub fn enumerate(&self) -> Result<Enumeration> {
        let devices = self.transport.devices()?;
        trace!("Transport reports {} USB devices", devices.len());
        Ok(Enumeration {
            devices,
            ids: self.ids.clone(),
            position: 0,
        })
    }

    /// Report whether `descriptor` can be opened without touching it
    ///
    /// A device held by this process reports [`DeviceAvailability::InUse`]
    /// until its [`Device`] is closed.
    pub fn availability(&self, descriptor: &DeviceDescriptor) -> Result<DeviceAvailability> {
        let state = self
            .transport
            .availability(descriptor, self.options.interface)
            .map_err(CandleError::from_open)?;
        trace!("{} is {}", descriptor, state);
        Ok(state)
    }

    /// Open a device and read its configuration
    ///
    /// Every channel is reset and left stopped.
    pub fn open(&self, descriptor: &DeviceDescriptor) -> Result<Device> {
        self.options.validate()?;
        let options = self.options.clone();

        let handle = self
            .transport
            .open(descriptor, options.interface)
            .map_err(CandleError::from_open)?;

        let (config, capabilities) = {
            let control = Control::new(
                handle.as_ref(),
                options.interface,
                options.control_timeout,
            );

            if options.send_host_format {
                if let Err(e) = control.host_format() {
                    warn!("{}: HOST_FORMAT failed, continuing: {}", descriptor, e);
                }
            }

            let config = control.get_device_config()?;
            let mut capabilities: Vec<BitTimingConst> =
                Vec::with_capacity(config.channel_count());
            for index in 0..config.channel_count() {
                let channel = index as u16;
                let mut caps = control.get_bit_timing_consts(channel)?;
                if caps.features.contains(Features::FD | Features::BT_CONST_EXT) {
                    caps = control.get_bit_timing_consts_ext(channel)?;
                }
                capabilities.push(caps);
            }

            for index in 0..config.channel_count() {
                control.set_mode(index as u16, &DeviceMode::reset())?;
            }
            (config, capabilities)
        };

        let info = DeviceInfo {
            sw_version: config.sw_version,
            hw_version: config.hw_version,
            channel_count: config.channel_count(),
            features: capabilities[0].features,
            clock_hz: capabilities[0].fclk_can,
        };
        debug!("Opened {}: {}", descriptor, info);

        let channels = capabilities
            .into_iter()
            .enumerate()
            .map(|(index, caps)| Arc::new(ChannelShared::new(index as u8, caps, &options)))
            .collect();
        let pool = BufferPool::new(options.rx_transfers, options.rx_buffer_size);

        let shared = Arc::new_cyclic(|me| DeviceShared {
            me: me.clone(),
            descriptor: descriptor.clone(),
            info,
            options,
            handle: RwLock::new(Some(handle)),
            closed: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            channels,
            rx_enabled: Mutex::new(false),
            rx_in_flight: InFlight::new(),
            rx_pool: Mutex::new(pool),
            counters: Counters::default(),
        });

        Ok(Device { shared })
    }
}
