//! gs_usb control request payloads
//!
//! Binary layouts exchanged through control transfers: device configuration,
//! bit timing and its constraints, device mode and CAN state. All fields
//! are little-endian `u32`s (except the leading bytes of
//! [`DeviceConfig`]) with no padding.

use std::fmt;

use crate::constants::{
    GS_CAN_MODE_RESET, GS_CAN_MODE_START, GS_USB_BREQ_BITTIMING, GS_USB_BREQ_BT_CONST,
    GS_USB_BREQ_BT_CONST_EXT, GS_USB_BREQ_DEVICE_CONFIG, GS_USB_BREQ_GET_STATE, GS_USB_BREQ_MODE,
};
use crate::error::{CandleError, Result};

pub(crate) fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn check_len(request: u8, data: &[u8], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(CandleError::Protocol {
            request,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

bitflags::bitflags! {
    /// Device feature bits reported in BT_CONST
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u32 {
        /// Listen-only mode (no ACKs sent)
        const LISTEN_ONLY = 1 << 0;
        /// Loopback mode
        const LOOP_BACK = 1 << 1;
        /// Triple sampling
        const TRIPLE_SAMPLE = 1 << 2;
        /// One-shot mode (no retransmission)
        const ONE_SHOT = 1 << 3;
        /// Hardware timestamps
        const HW_TIMESTAMP = 1 << 4;
        /// Identify (LED blink)
        const IDENTIFY = 1 << 5;
        /// User ID storage
        const USER_ID = 1 << 6;
        /// Packet padding to max packet size
        const PAD_PKTS_TO_MAX_PKT_SIZE = 1 << 7;
        /// CAN FD
        const FD = 1 << 8;
        /// LPC546XX USB quirk required
        const REQ_USB_QUIRK_LPC546XX = 1 << 9;
        /// BT_CONST_EXT request available
        const BT_CONST_EXT = 1 << 10;
        /// Switchable bus termination
        const TERMINATION = 1 << 11;
        /// Bus error reporting
        const BERR_REPORTING = 1 << 12;
        /// GET_STATE request available
        const GET_STATE = 1 << 13;
    }
}

impl Features {
    /// Names of the set feature bits, lowest bit first
    pub fn names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

bitflags::bitflags! {
    /// Mode flags sent with the MODE request when starting a channel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeFlags: u32 {
        /// Listen-only mode
        const LISTEN_ONLY = 1 << 0;
        /// Loopback mode
        const LOOP_BACK = 1 << 1;
        /// Triple sampling
        const TRIPLE_SAMPLE = 1 << 2;
        /// One-shot mode
        const ONE_SHOT = 1 << 3;
        /// Append hardware timestamps to received frames
        const HW_TIMESTAMP = 1 << 4;
        /// Identify (LED blink)
        const IDENTIFY = 1 << 5;
        /// User ID
        const USER_ID = 1 << 6;
        /// Pad packets to max packet size
        const PAD_PKTS_TO_MAX_PKT_SIZE = 1 << 7;
        /// CAN FD
        const FD = 1 << 8;
        /// Bus error reporting
        const BERR_REPORTING = 1 << 12;
    }
}

impl ModeFlags {
    /// Normal operation, no optional behaviour
    pub const NORMAL: ModeFlags = ModeFlags::empty();

    /// Features the device must advertise for these flags to be accepted
    ///
    /// Each mode bit shares its position with the matching feature bit.
    pub fn required_features(&self) -> Features {
        Features::from_bits_truncate(self.bits())
    }
}

// ============================================================================
// Device Mode
// ============================================================================

/// Device mode configuration (MODE request, 8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMode {
    /// Mode value (0 = reset/stop, 1 = start)
    pub mode: u32,
    /// Mode flags
    pub flags: ModeFlags,
}

impl DeviceMode {
    pub const SIZE: usize = 8;

    /// Start the channel with the given flags
    pub fn start(flags: ModeFlags) -> Self {
        Self {
            mode: GS_CAN_MODE_START,
            flags,
        }
    }

    /// Stop (reset) the channel
    pub fn reset() -> Self {
        Self {
            mode: GS_CAN_MODE_RESET,
            flags: ModeFlags::empty(),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(GS_USB_BREQ_MODE, data, Self::SIZE)?;
        Ok(Self {
            mode: le_u32(data, 0),
            flags: ModeFlags::from_bits_retain(le_u32(data, 4)),
        })
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mode: {}\nFlags: 0x{:08x}", self.mode, self.flags.bits())
    }
}

// ============================================================================
// Bit Timing
// ============================================================================

/// CAN bit timing (BITTIMING / DATA_BITTIMING request, 20 bytes)
///
/// All values are in time quanta except `brp`, which divides the CAN clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    /// Propagation segment
    pub prop_seg: u32,
    /// Phase segment 1
    pub phase_seg1: u32,
    /// Phase segment 2
    pub phase_seg2: u32,
    /// Synchronization jump width
    pub sjw: u32,
    /// Baud rate prescaler
    pub brp: u32,
}

impl BitTiming {
    pub const SIZE: usize = 20;

    pub fn new(prop_seg: u32, phase_seg1: u32, phase_seg2: u32, sjw: u32, brp: u32) -> Self {
        Self {
            prop_seg,
            phase_seg1,
            phase_seg2,
            sjw,
            brp,
        }
    }

    /// Time segment 1 (propagation + phase segment 1)
    pub fn tseg1(&self) -> u32 {
        self.prop_seg + self.phase_seg1
    }

    /// Time segment 2
    pub fn tseg2(&self) -> u32 {
        self.phase_seg2
    }

    /// Time quanta per bit, including the sync segment
    pub fn time_quanta(&self) -> u32 {
        1 + self.tseg1() + self.tseg2()
    }

    /// Resulting bitrate for a CAN clock, or 0 for a degenerate timing
    pub fn bitrate(&self, clock_hz: u32) -> u32 {
        let divisor = u64::from(self.brp) * u64::from(self.time_quanta());
        if divisor == 0 {
            return 0;
        }
        (u64::from(clock_hz) / divisor) as u32
    }

    /// Sample point as a percentage of the bit time
    pub fn sample_point(&self) -> f32 {
        (1 + self.tseg1()) as f32 * 100.0 / self.time_quanta() as f32
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.prop_seg.to_le_bytes());
        buf[4..8].copy_from_slice(&self.phase_seg1.to_le_bytes());
        buf[8..12].copy_from_slice(&self.phase_seg2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sjw.to_le_bytes());
        buf[16..20].copy_from_slice(&self.brp.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(GS_USB_BREQ_BITTIMING, data, Self::SIZE)?;
        Ok(Self {
            prop_seg: le_u32(data, 0),
            phase_seg1: le_u32(data, 4),
            phase_seg2: le_u32(data, 8),
            sjw: le_u32(data, 12),
            brp: le_u32(data, 16),
        })
    }
}

impl fmt::Display for BitTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Prop Seg: {}\nPhase Seg 1: {}\nPhase Seg 2: {}\nSJW: {}\nBRP: {}",
            self.prop_seg, self.phase_seg1, self.phase_seg2, self.sjw, self.brp
        )
    }
}

/// Bit timing constraints for one phase (nominal or data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingLimits {
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
}

impl TimingLimits {
    const SIZE: usize = 32;

    fn encode_into(&self, buf: &mut [u8]) {
        let fields = [
            self.tseg1_min,
            self.tseg1_max,
            self.tseg2_min,
            self.tseg2_max,
            self.sjw_max,
            self.brp_min,
            self.brp_max,
            self.brp_inc,
        ];
        for (i, value) in fields.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn decode_at(data: &[u8], offset: usize) -> Self {
        Self {
            tseg1_min: le_u32(data, offset),
            tseg1_max: le_u32(data, offset + 4),
            tseg2_min: le_u32(data, offset + 8),
            tseg2_max: le_u32(data, offset + 12),
            sjw_max: le_u32(data, offset + 16),
            brp_min: le_u32(data, offset + 20),
            brp_max: le_u32(data, offset + 24),
            brp_inc: le_u32(data, offset + 28),
        }
    }
}

impl fmt::Display for TimingLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TSEG1: {} - {}\nTSEG2: {} - {}\nSJW (max): {}\nBRP: {} - {} (inc: {})",
            self.tseg1_min,
            self.tseg1_max,
            self.tseg2_min,
            self.tseg2_max,
            self.sjw_max,
            self.brp_min,
            self.brp_max,
            self.brp_inc
        )
    }
}

/// Channel capability: features, CAN clock and timing constraints
///
/// Decoded from BT_CONST (40 bytes) or BT_CONST_EXT (72 bytes). Only the
/// extended form carries `data` phase limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTimingConst {
    /// Feature bitfield
    pub features: Features,
    /// CAN clock frequency in Hz
    pub fclk_can: u32,
    /// Nominal (arbitration) phase limits
    pub nominal: TimingLimits,
    /// Data phase limits (CAN FD)
    pub data: Option<TimingLimits>,
}

impl BitTimingConst {
    pub const SIZE: usize = 40;
    pub const SIZE_EXT: usize = 72;

    /// Decode a BT_CONST response
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(GS_USB_BREQ_BT_CONST, data, Self::SIZE)?;
        Ok(Self::decode_common(data))
    }

    /// Decode a BT_CONST_EXT response
    pub fn decode_extended(data: &[u8]) -> Result<Self> {
        check_len(GS_USB_BREQ_BT_CONST_EXT, data, Self::SIZE_EXT)?;
        let mut cap = Self::decode_common(data);
        cap.data = Some(TimingLimits::decode_at(data, Self::SIZE));
        Ok(cap)
    }

    fn decode_common(data: &[u8]) -> Self {
        Self {
            features: Features::from_bits_retain(le_u32(data, 0)),
            fclk_can: le_u32(data, 4),
            nominal: TimingLimits::decode_at(data, 8),
            data: None,
        }
    }

    /// Encode as BT_CONST, or BT_CONST_EXT when data limits are present
    pub fn encode(&self) -> Vec<u8> {
        let size = if self.data.is_some() {
            Self::SIZE_EXT
        } else {
            Self::SIZE
        };
        let mut buf = vec![0u8; size];
        buf[0..4].copy_from_slice(&self.features.bits().to_le_bytes());
        buf[4..8].copy_from_slice(&self.fclk_can.to_le_bytes());
        self.nominal.encode_into(&mut buf[8..8 + TimingLimits::SIZE]);
        if let Some(data) = &self.data {
            data.encode_into(&mut buf[Self::SIZE..Self::SIZE_EXT]);
        }
        buf
    }

    /// Check if CAN FD data phase limits are available
    pub fn has_fd_timing(&self) -> bool {
        self.data.is_some()
    }

    /// Get clock frequency in MHz
    pub fn clock_mhz(&self) -> f32 {
        self.fclk_can as f32 / 1_000_000.0
    }
}

impl fmt::Display for BitTimingConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Feature bitfield: 0x{:08x}\nClock: {} Hz ({:.1} MHz)\n{}",
            self.features.bits(),
            self.fclk_can,
            self.clock_mhz(),
            self.nominal
        )?;
        if let Some(data) = &self.data {
            write!(f, "\nData Phase (CAN FD):\n{}", data)?;
        }
        Ok(())
    }
}

// ============================================================================
// Device Config
// ============================================================================

/// Device configuration (DEVICE_CONFIG response, 12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Interface count (number of CAN channels - 1)
    pub icount: u8,
    /// Firmware version (tenths)
    pub sw_version: u32,
    /// Hardware version (tenths)
    pub hw_version: u32,
}

impl DeviceConfig {
    pub const SIZE: usize = 12;

    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(GS_USB_BREQ_DEVICE_CONFIG, data, Self::SIZE)?;
        Ok(Self {
            icount: data[3],
            sw_version: le_u32(data, 4),
            hw_version: le_u32(data, 8),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[3] = self.icount;
        buf[4..8].copy_from_slice(&self.sw_version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.hw_version.to_le_bytes());
        buf
    }

    /// Get the number of CAN channels
    pub fn channel_count(&self) -> usize {
        usize::from(self.icount) + 1
    }

    /// Get firmware version as a float
    pub fn firmware_version(&self) -> f32 {
        self.sw_version as f32 / 10.0
    }

    /// Get hardware version as a float
    pub fn hardware_version(&self) -> f32 {
        self.hw_version as f32 / 10.0
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iCount: {}\nFW Version: {:.1}\nHW Version: {:.1}",
            self.icount,
            self.firmware_version(),
            self.hardware_version()
        )
    }
}

// ============================================================================
// CAN State
// ============================================================================

/// CAN controller state reported by GET_STATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanState {
    /// Normal operation
    ErrorActive,
    /// TEC/REC > 96
    ErrorWarning,
    /// TEC/REC > 127
    ErrorPassive,
    /// TEC > 255
    BusOff,
    /// Controller stopped
    Stopped,
    /// Controller sleeping
    Sleeping,
    /// Value not defined by the protocol
    Unknown(u32),
}

impl CanState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => CanState::ErrorActive,
            1 => CanState::ErrorWarning,
            2 => CanState::ErrorPassive,
            3 => CanState::BusOff,
            4 => CanState::Stopped,
            5 => CanState::Sleeping,
            other => CanState::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            CanState::ErrorActive => 0,
            CanState::ErrorWarning => 1,
            CanState::ErrorPassive => 2,
            CanState::BusOff => 3,
            CanState::Stopped => 4,
            CanState::Sleeping => 5,
            CanState::Unknown(raw) => raw,
        }
    }

    /// Get human-readable name for CAN state
    pub fn name(&self) -> &'static str {
        match self {
            CanState::ErrorActive => "ERROR_ACTIVE",
            CanState::ErrorWarning => "ERROR_WARNING",
            CanState::ErrorPassive => "ERROR_PASSIVE",
            CanState::BusOff => "BUS_OFF",
            CanState::Stopped => "STOPPED",
            CanState::Sleeping => "SLEEPING",
            CanState::Unknown(_) => "UNKNOWN",
        }
    }
}

/// CAN state and error counters (GET_STATE response, 12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub state: CanState,
    /// RX error counter
    pub rxerr: u32,
    /// TX error counter
    pub txerr: u32,
}

impl DeviceState {
    pub const SIZE: usize = 12;

    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(GS_USB_BREQ_GET_STATE, data, Self::SIZE)?;
        Ok(Self {
            state: CanState::from_raw(le_u32(data, 0)),
            rxerr: le_u32(data, 4),
            txerr: le_u32(data, 8),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.state.to_raw().to_le_bytes());
        buf[4..8].copy_from_slice(&self.rxerr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.txerr.to_le_bytes());
        buf
    }

    /// Check if bus is off (TEC > 255)
    pub fn is_bus_off(&self) -> bool {
        self.state == CanState::BusOff
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State: {}\nRX Error Counter: {}\nTX Error Counter: {}",
            self.state.name(),
            self.rxerr,
            self.txerr
        )
    }
}
