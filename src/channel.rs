//! CAN channel state machine
//!
//! A [`Channel`] is a cheap, cloneable handle to one CAN controller of an
//! open [`crate::Device`]. It holds a weak reference to the device, so every
//! operation fails with [`CandleError::DeviceClosed`] once the device is
//! closed or dropped.
//!
//! ```text
//! Stopped --set_bit_timing / set_data_bit_timing / set_termination--> Stopped
//! Stopped --start--> Running --stop--> Stopped
//! ```
//!
//! `send` and `receive` are only valid while running; timing and
//! termination changes only while stopped.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::config::{DeviceOptions, RxOverflow};
use crate::constants::{
    GS_USB_ENDPOINT_OUT, GS_USB_RX_ECHO_ID, RX_REORDER_DEPTH, RX_REORDER_WINDOW_US,
};
use crate::device::{DeviceShared, InFlight};
use crate::error::{CandleError, Result, TransportError};
use crate::fifo::Fifo;
use crate::frame::{CanFrame, HostFrame};
use crate::structures::{
    BitTiming, BitTimingConst, DeviceMode, DeviceState, Features, ModeFlags, TimingLimits,
};
use crate::timing::{self, DEFAULT_DATA_SAMPLE_POINT, DEFAULT_SAMPLE_POINT};
use crate::transport::Transfer;

/// Whether hardware timestamp `a` was taken before `b`
///
/// The device counter wraps at 2^32 us, so only gaps inside the reorder
/// window count as ordering.
fn timestamp_before(a: u32, b: u32) -> bool {
    let gap = b.wrapping_sub(a);
    gap != 0 && gap < RX_REORDER_WINDOW_US
}

/// Channel run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Stopped,
    Running,
}

impl ChannelState {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Running => "running",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Frames queued for `receive`
    pub rx_frames: u64,
    /// Frames discarded because the receive FIFO was full
    pub rx_dropped: u64,
    /// Frames flagged by the device as following a device-side overflow
    pub rx_overflows: u64,
    /// Transmits completed successfully
    pub tx_frames: u64,
    /// Transmits that failed or were cancelled
    pub tx_errors: u64,
    /// Echoes of our own transmissions
    pub tx_echoes: u64,
}

#[derive(Default)]
struct Counters {
    rx_frames: AtomicU64,
    rx_dropped: AtomicU64,
    rx_overflows: AtomicU64,
    tx_frames: AtomicU64,
    tx_errors: AtomicU64,
    tx_echoes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct ChannelConfig {
    state: ChannelState,
    mode: ModeFlags,
    bit_timing: Option<BitTiming>,
    data_bit_timing: Option<BitTiming>,
    termination: Option<bool>,
}

impl ChannelConfig {
    fn ensure_stopped(&self, operation: &'static str) -> Result<()> {
        if self.state == ChannelState::Running {
            return Err(CandleError::InvalidState {
                operation,
                state: ChannelState::Running.name(),
            });
        }
        Ok(())
    }
}

struct RxQueue {
    fifo: Fifo<CanFrame>,
    /// Cleared when the channel stops; frames arriving afterwards are dropped
    open: bool,
}

/// State of one channel shared between its handles and the receive path
pub(crate) struct ChannelShared {
    index: u8,
    capabilities: BitTimingConst,
    config: Mutex<ChannelConfig>,
    rx: Mutex<RxQueue>,
    rx_ready: Condvar,
    tx: InFlight,
    tx_capacity: usize,
    next_echo_id: AtomicU32,
    counters: Counters,
    rx_overflow: RxOverflow,
    receive_echo: bool,
}

impl ChannelShared {
    pub(crate) fn new(index: u8, capabilities: BitTimingConst, options: &DeviceOptions) -> Self {
        Self {
            index,
            capabilities,
            config: Mutex::new(ChannelConfig {
                state: ChannelState::Stopped,
                mode: ModeFlags::NORMAL,
                bit_timing: None,
                data_bit_timing: None,
                termination: None,
            }),
            rx: Mutex::new(RxQueue {
                fifo: Fifo::with_capacity(options.rx_fifo_capacity.max(1)),
                open: false,
            }),
            rx_ready: Condvar::new(),
            tx: InFlight::new(),
            tx_capacity: options.tx_capacity,
            next_echo_id: AtomicU32::new(0),
            counters: Counters::default(),
            rx_overflow: options.rx_overflow,
            receive_echo: options.receive_echo,
        }
    }

    pub(crate) fn index(&self) -> u8 {
        self.index
    }

    pub(crate) fn is_running(&self) -> bool {
        self.config.lock().state == ChannelState::Running
    }

    /// Expected host frame size when the channel pads frames to the packet size
    pub(crate) fn padded_frame_len(&self, fd: bool) -> Option<usize> {
        let config = self.config.lock();
        if config.state != ChannelState::Running
            || !config.mode.contains(ModeFlags::PAD_PKTS_TO_MAX_PKT_SIZE)
        {
            return None;
        }
        Some(HostFrame::frame_size(
            config.mode.contains(ModeFlags::HW_TIMESTAMP),
            fd,
        ))
    }

    /// Queue a frame received from the device
    pub(crate) fn deliver(&self, frame: CanFrame) {
        if frame.is_overflow() {
            bump(&self.counters.rx_overflows);
        }
        if frame.is_echo() {
            bump(&self.counters.tx_echoes);
            if !self.receive_echo {
                return;
            }
        }

        let mut rx = self.rx.lock();
        if !rx.open {
            return;
        }
        match self.rx_overflow {
            RxOverflow::DropNewest => {
                if !rx.fifo.push(frame) {
                    bump(&self.counters.rx_dropped);
                    trace!("Channel {}: FIFO full, dropping {}", self.index, frame);
                    return;
                }
            }
            RxOverflow::DropOldest => {
                if let Some(evicted) = rx.fifo.push_overwrite(frame) {
                    bump(&self.counters.rx_dropped);
                    trace!("Channel {}: FIFO full, evicting {}", self.index, evicted);
                }
            }
        }
        // Receive transfers may complete out of order
        if frame.timestamp_us().is_some() {
            let moved = rx.fifo.sift_back(RX_REORDER_DEPTH, |newest, queued| {
                match (newest.timestamp_us(), queued.timestamp_us()) {
                    (Some(a), Some(b)) => timestamp_before(a, b),
                    _ => false,
                }
            });
            if moved > 0 {
                trace!("Channel {}: reordered {} by {}", self.index, frame, moved);
            }
        }
        bump(&self.counters.rx_frames);
        drop(rx);
        self.rx_ready.notify_one();
    }

    /// Account for a finished transmit
    pub(crate) fn transmit_complete(&self, echo_id: u32, status: &std::result::Result<(), TransportError>) {
        self.tx.release();
        match status {
            Ok(()) => {
                bump(&self.counters.tx_frames);
                trace!("Channel {}: transmit {} complete", self.index, echo_id);
            }
            Err(e) => {
                bump(&self.counters.tx_errors);
                if *e != TransportError::Cancelled {
                    debug!("Channel {}: transmit {} failed: {}", self.index, echo_id, e);
                }
            }
        }
    }

    /// Wake blocked receivers so they re-check device state
    pub(crate) fn wake_receivers(&self) {
        let _rx = self.rx.lock();
        self.rx_ready.notify_all();
    }

    fn open_rx(&self) {
        let mut rx = self.rx.lock();
        rx.fifo.clear();
        rx.open = true;
    }

    fn close_rx(&self) {
        self.rx.lock().open = false;
        self.rx_ready.notify_all();
    }

    fn clear_rx(&self) {
        self.rx.lock().fifo.clear();
    }

    /// Mark the channel stopped without I/O; returns whether it was running
    pub(crate) fn force_stop(&self) -> bool {
        let was_running = {
            let mut config = self.config.lock();
            let running = config.state == ChannelState::Running;
            config.state = ChannelState::Stopped;
            running
        };
        self.close_rx();
        was_running
    }

    /// Finish stopping once transfers are drained
    pub(crate) fn finish_stop(&self) {
        self.clear_rx();
    }

    pub(crate) fn wait_tx_idle(&self, timeout: Duration) -> bool {
        self.tx.wait_idle(timeout)
    }

    fn next_echo_id(&self) -> u32 {
        loop {
            let id = self.next_echo_id.fetch_add(1, Ordering::Relaxed);
            if id != GS_USB_RX_ECHO_ID {
                return id;
            }
        }
    }

    fn stats(&self) -> ChannelStats {
        let c = &self.counters;
        ChannelStats {
            rx_frames: c.rx_frames.load(Ordering::Relaxed),
            rx_dropped: c.rx_dropped.load(Ordering::Relaxed),
            rx_overflows: c.rx_overflows.load(Ordering::Relaxed),
            tx_frames: c.tx_frames.load(Ordering::Relaxed),
            tx_errors: c.tx_errors.load(Ordering::Relaxed),
            tx_echoes: c.tx_echoes.load(Ordering::Relaxed),
        }
    }
}

/// Handle to one CAN channel of an open device
#[derive(Clone)]
pub struct Channel {
    device: Weak<DeviceShared>,
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(device: Weak<DeviceShared>, shared: Arc<ChannelShared>) -> Self {
        Self { device, shared }
    }

    fn device(&self) -> Result<Arc<DeviceShared>> {
        let device = self.device.upgrade().ok_or(CandleError::DeviceClosed)?;
        if device.is_closed() {
            return Err(CandleError::DeviceClosed);
        }
        Ok(device)
    }

    fn require(&self, feature: Features, name: &'static str) -> Result<()> {
        if !self.shared.capabilities.features.contains(feature) {
            return Err(CandleError::FeatureNotSupported(name));
        }
        Ok(())
    }

    fn data_limits(&self) -> Result<TimingLimits> {
        self.require(Features::FD, "FD")?;
        self.shared
            .capabilities
            .data
            .ok_or(CandleError::FeatureNotSupported("BT_CONST_EXT"))
    }

    fn channel_value(&self) -> u16 {
        u16::from(self.shared.index)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the channel
    ///
    /// # Arguments
    /// * `flags` - Mode flags; each must be backed by an advertised feature
    pub fn start(&self, flags: ModeFlags) -> Result<()> {
        let device = self.device()?;
        let _lifecycle = device.lifecycle().lock();
        let mut config = self.shared.config.lock();
        if config.state == ChannelState::Running {
            return Err(CandleError::InvalidState {
                operation: "start",
                state: ChannelState::Running.name(),
            });
        }

        let missing = flags.required_features() - self.shared.capabilities.features;
        if let Some((name, _)) = missing.iter_names().next() {
            return Err(CandleError::FeatureNotSupported(name));
        }

        let channel = self.channel_value();
        device.with_control(|c| c.set_mode(channel, &DeviceMode::start(flags)))?;
        self.shared.open_rx();
        config.state = ChannelState::Running;
        config.mode = flags;
        drop(config);

        if let Err(e) = device.start_rx() {
            self.shared.force_stop();
            let _ = device.with_control(|c| c.set_mode(channel, &DeviceMode::reset()));
            return Err(e);
        }

        debug!("Channel {} started with flags {:?}", self.shared.index, flags);
        Ok(())
    }

    /// Stop the channel
    ///
    /// Wakes blocked receivers. When no other channel of the device is
    /// running, outstanding transfers are cancelled and drained before the
    /// receive FIFO is cleared.
    pub fn stop(&self) -> Result<()> {
        let device = self.device()?;
        let _lifecycle = device.lifecycle().lock();
        if !self.shared.is_running() {
            return Err(CandleError::InvalidState {
                operation: "stop",
                state: ChannelState::Stopped.name(),
            });
        }

        let channel = self.channel_value();
        let reset = device.with_control(|c| c.set_mode(channel, &DeviceMode::reset()));
        self.shared.force_stop();

        if !device.any_running() {
            device.stop_rx();
        }
        self.shared.finish_stop();

        debug!("Channel {} stopped", self.shared.index);
        reset
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Queue a frame for transmission
    ///
    /// Returns the echo ID the device will report for this frame. Fails with
    /// `QueueFull` when `tx_capacity` transmits are already in flight.
    pub fn send(&self, frame: &CanFrame) -> Result<u32> {
        let device = self.device()?;
        // Held across submit: `stop` marks the channel stopped under this lock
        // before it cancels transfers
        let config = self.shared.config.lock();
        if config.state != ChannelState::Running {
            return Err(CandleError::InvalidState {
                operation: "send",
                state: ChannelState::Stopped.name(),
            });
        }

        if frame.is_fd() && !config.mode.contains(ModeFlags::FD) {
            return Err(CandleError::invalid_parameter(
                "frame",
                frame.raw_id(),
                "FD frame on a channel not started in FD mode",
            ));
        }

        if !self.shared.tx.try_acquire(self.shared.tx_capacity) {
            return Err(CandleError::QueueFull);
        }

        let echo_id = self.shared.next_echo_id();
        let wire = frame.with_timestamp(None).with_echo_id(Some(echo_id));
        let bytes = HostFrame::new(self.shared.index, wire).encode();
        let transfer = Transfer::transmit(
            GS_USB_ENDPOINT_OUT,
            self.shared.index,
            echo_id,
            bytes,
            device.options().transmit_timeout,
        );

        if let Err(e) = device.submit(transfer) {
            self.shared.tx.release();
            return Err(e);
        }
        drop(config);

        trace!("Channel {}: TX {} echo {}", self.shared.index, frame, echo_id);
        Ok(echo_id)
    }

    /// Take the next received frame
    ///
    /// `Some(Duration::ZERO)` polls, `Some(d)` waits at most `d`, `None`
    /// waits until a frame arrives or the channel stops. Returns `Ok(None)`
    /// on timeout or when the channel is stopped while waiting.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Option<CanFrame>> {
        let device = self.device()?;
        if !self.shared.is_running() {
            return Err(CandleError::InvalidState {
                operation: "receive",
                state: ChannelState::Stopped.name(),
            });
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut rx = self.shared.rx.lock();
        loop {
            if let Some(frame) = rx.fifo.pop() {
                return Ok(Some(frame));
            }
            if !rx.open {
                return Ok(None);
            }
            if device.is_gone() {
                return Err(CandleError::DeviceGone);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    self.shared.rx_ready.wait_until(&mut rx, deadline);
                }
                None => self.shared.rx_ready.wait(&mut rx),
            }
        }
    }

    /// Take a received frame without waiting
    pub fn try_receive(&self) -> Result<Option<CanFrame>> {
        self.receive(Some(Duration::ZERO))
    }

    // ========================================================================
    // Bit timing
    // ========================================================================

    /// Set nominal (arbitration phase) bit timing
    pub fn set_bit_timing(&self, timing: BitTiming) -> Result<()> {
        let device = self.device()?;
        let mut config = self.shared.config.lock();
        config.ensure_stopped("set bit timing")?;
        timing::validate(&timing, &self.shared.capabilities.nominal)?;

        let channel = self.channel_value();
        device.with_control(|c| c.set_bit_timing(channel, &timing))?;
        config.bit_timing = Some(timing);

        debug!(
            "Channel {}: nominal timing {} bit/s, sample point {:.1}%",
            self.shared.index,
            timing.bitrate(self.shared.capabilities.fclk_can),
            timing.sample_point()
        );
        Ok(())
    }

    /// Set CAN FD data phase bit timing
    pub fn set_data_bit_timing(&self, timing: BitTiming) -> Result<()> {
        let device = self.device()?;
        let mut config = self.shared.config.lock();
        config.ensure_stopped("set data bit timing")?;
        let limits = self.data_limits()?;
        timing::validate(&timing, &limits)?;

        let channel = self.channel_value();
        device.with_control(|c| c.set_data_bit_timing(channel, &timing))?;
        config.data_bit_timing = Some(timing);

        debug!(
            "Channel {}: data timing {} bit/s, sample point {:.1}%",
            self.shared.index,
            timing.bitrate(self.shared.capabilities.fclk_can),
            timing.sample_point()
        );
        Ok(())
    }

    /// Set the CAN bitrate at an 87.5% sample point
    ///
    /// Common bitrates:
    /// - 10000 (10 kbps)
    /// - 125000 (125 kbps)
    /// - 250000 (250 kbps)
    /// - 500000 (500 kbps)
    /// - 1000000 (1 Mbps)
    pub fn set_bitrate(&self, bitrate: u32) -> Result<()> {
        self.set_bitrate_with_sample_point(bitrate, DEFAULT_SAMPLE_POINT)
    }

    /// Set the CAN bitrate with a specific sample point
    ///
    /// # Arguments
    /// * `bitrate` - Bitrate in bits per second
    /// * `sample_point` - Sample point percentage (typically 87.5%)
    pub fn set_bitrate_with_sample_point(&self, bitrate: u32, sample_point: f32) -> Result<()> {
        self.shared.config.lock().ensure_stopped("set bitrate")?;
        let caps = &self.shared.capabilities;
        let timing = timing::calc_bit_timing(bitrate, sample_point, caps.fclk_can, &caps.nominal)?;
        self.set_bit_timing(timing)
    }

    /// Set the CAN FD data phase bitrate at a 75% sample point
    pub fn set_data_bitrate(&self, bitrate: u32) -> Result<()> {
        self.set_data_bitrate_with_sample_point(bitrate, DEFAULT_DATA_SAMPLE_POINT)
    }

    /// Set the CAN FD data phase bitrate with a specific sample point
    pub fn set_data_bitrate_with_sample_point(
        &self,
        bitrate: u32,
        sample_point: f32,
    ) -> Result<()> {
        self.shared.config.lock().ensure_stopped("set data bitrate")?;
        let limits = self.data_limits()?;
        let timing = timing::calc_bit_timing(
            bitrate,
            sample_point,
            self.shared.capabilities.fclk_can,
            &limits,
        )?;
        self.set_data_bit_timing(timing)
    }

    // ========================================================================
    // Termination, identify, state
    // ========================================================================

    /// Enable or disable the on-board termination resistor
    pub fn set_termination(&self, enabled: bool) -> Result<()> {
        let device = self.device()?;
        let mut config = self.shared.config.lock();
        config.ensure_stopped("set termination")?;
        self.require(Features::TERMINATION, "TERMINATION")?;

        let channel = self.channel_value();
        device.with_control(|c| c.set_termination(channel, enabled))?;
        config.termination = Some(enabled);
        Ok(())
    }

    /// Read the termination resistor state from the device
    pub fn termination(&self) -> Result<bool> {
        let device = self.device()?;
        self.require(Features::TERMINATION, "TERMINATION")?;
        let channel = self.channel_value();
        let enabled = device.with_control(|c| c.get_termination(channel))?;
        self.shared.config.lock().termination = Some(enabled);
        Ok(enabled)
    }

    /// Blink the channel LED
    pub fn identify(&self, enabled: bool) -> Result<()> {
        let device = self.device()?;
        self.require(Features::IDENTIFY, "IDENTIFY")?;
        let channel = self.channel_value();
        device.with_control(|c| c.set_identify(channel, enabled))
    }

    /// Get CAN controller state and error counters
    pub fn get_state(&self) -> Result<DeviceState> {
        let device = self.device()?;
        self.require(Features::GET_STATE, "GET_STATE")?;
        let channel = self.channel_value();
        device.with_control(|c| c.get_state(channel))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn index(&self) -> u8 {
        self.shared.index
    }

    pub fn state(&self) -> ChannelState {
        self.shared.config.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Timing constraints and feature bits reported by the device
    pub fn capabilities(&self) -> BitTimingConst {
        self.shared.capabilities
    }

    pub fn features(&self) -> Features {
        self.shared.capabilities.features
    }

    /// Check if the channel supports CAN FD
    pub fn supports_fd(&self) -> bool {
        self.shared.capabilities.features.contains(Features::FD)
    }

    /// Flags of the current run, `None` while stopped
    pub fn mode(&self) -> Option<ModeFlags> {
        let config = self.shared.config.lock();
        (config.state == ChannelState::Running).then_some(config.mode)
    }

    /// Last nominal timing applied
    pub fn bit_timing(&self) -> Option<BitTiming> {
        self.shared.config.lock().bit_timing
    }

    /// Last data phase timing applied
    pub fn data_bit_timing(&self) -> Option<BitTiming> {
        self.shared.config.lock().data_bit_timing
    }

    /// Nominal bitrate of the last applied timing
    pub fn bitrate(&self) -> Option<u32> {
        self.bit_timing()
            .map(|t| t.bitrate(self.shared.capabilities.fclk_can))
    }

    pub fn tx_in_flight(&self) -> usize {
        self.shared.tx.count()
    }

    pub fn tx_capacity(&self) -> usize {
        self.shared.tx_capacity
    }

    /// Frames waiting in the receive FIFO
    pub fn rx_pending(&self) -> usize {
        self.shared.rx.lock().fifo.len()
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.stats()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("index", &self.shared.index)
            .field("state", &self.state())
            .field("tx_in_flight", &self.tx_in_flight())
            .field("rx_pending", &self.rx_pending())
            .finish()
    }
}
