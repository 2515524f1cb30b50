//! CAN frames and the gs_usb host frame codec
//!
//! [`CanFrame`] is the value exchanged with callers. [`HostFrame`] pairs it
//! with a channel index and converts to and from the `gs_host_frame` bytes
//! carried by each bulk transfer:
//!
//! ```text
//! 0  echo_id  u32    0xFFFFFFFF for frames received from the bus
//! 4  can_id   u32    EFF / RTR / ERR flags in the top three bits
//! 8  can_dlc  u8
//! 9  channel  u8
//! 10 flags    u8     OVERFLOW, FD, BRS, ESI
//! 11 reserved u8
//! 12 data     8 bytes (classic) or 64 bytes (FD)
//! .. timestamp_us u32, only when hardware timestamps are enabled
//! ```

use std::fmt;

use embedded_can::{ExtendedId, Id, StandardId};

use crate::constants::{
    CANFD_DLC_TO_LEN, CANFD_MAX_DLC, CANFD_MAX_DLEN, CAN_EFF_FLAG, CAN_EFF_MASK, CAN_ERR_FLAG,
    CAN_MAX_DLEN, CAN_RTR_FLAG, CAN_SFF_MASK, GS_CAN_FLAG_BRS, GS_CAN_FLAG_ESI, GS_CAN_FLAG_FD,
    GS_CAN_FLAG_OVERFLOW, GS_CAN_FLAG_RESERVED_MASK, GS_USB_FRAME_HEADER_SIZE, GS_USB_FRAME_SIZE,
    GS_USB_FRAME_SIZE_FD, GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP, GS_USB_FRAME_SIZE_HW_TIMESTAMP,
    GS_USB_RX_ECHO_ID, GS_USB_TIMESTAMP_SIZE,
};
use crate::error::{CandleError, Result};
use crate::structures::le_u32;

/// Convert DLC to data length
pub fn dlc_to_len(dlc: u8, fd: bool) -> usize {
    if fd {
        if (dlc as usize) < CANFD_DLC_TO_LEN.len() {
            CANFD_DLC_TO_LEN[dlc as usize]
        } else {
            CANFD_MAX_DLEN
        }
    } else {
        (dlc as usize).min(CAN_MAX_DLEN)
    }
}

/// Convert data length to DLC, rounding FD lengths up
pub fn len_to_dlc(length: usize, fd: bool) -> u8 {
    if fd {
        for (dlc, &dlen) in CANFD_DLC_TO_LEN.iter().enumerate() {
            if dlen >= length {
                return dlc as u8;
            }
        }
        CANFD_MAX_DLC
    } else {
        length.min(CAN_MAX_DLEN) as u8
    }
}

bitflags::bitflags! {
    /// Frame attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Remote transmission request
        const REMOTE = 1 << 0;
        /// Error frame; the identifier carries the error class
        const ERROR = 1 << 1;
        /// CAN FD frame
        const FD = 1 << 2;
        /// Bit rate switch (FD only)
        const BRS = 1 << 3;
        /// Error state indicator (FD only)
        const ESI = 1 << 4;
        /// Device reported an RX overflow before this frame
        const OVERFLOW = 1 << 5;
    }
}

/// A classic or FD CAN frame
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    flags: FrameFlags,
    dlc: u8,
    data: [u8; CANFD_MAX_DLEN],
    echo_id: Option<u32>,
    timestamp_us: Option<u32>,
}

impl CanFrame {
    fn blank(id: Id, flags: FrameFlags, dlc: u8) -> Self {
        Self {
            id,
            flags,
            dlc,
            data: [0u8; CANFD_MAX_DLEN],
            echo_id: None,
            timestamp_us: None,
        }
    }

    /// Create a classic data frame; `None` if `data` exceeds 8 bytes
    pub fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > CAN_MAX_DLEN {
            return None;
        }
        let mut frame = Self::blank(id.into(), FrameFlags::empty(), data.len() as u8);
        frame.data[..data.len()].copy_from_slice(data);
        Some(frame)
    }

    /// Create a classic remote frame requesting `dlc` bytes
    pub fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > CAN_MAX_DLEN {
            return None;
        }
        Some(Self::blank(id.into(), FrameFlags::REMOTE, dlc as u8))
    }

    /// Create a CAN FD frame; `None` if `data` exceeds 64 bytes
    ///
    /// Lengths that have no exact FD DLC are zero-padded to the next valid
    /// length.
    pub fn new_fd(id: impl Into<Id>, data: &[u8], brs: bool) -> Option<Self> {
        if data.len() > CANFD_MAX_DLEN {
            return None;
        }
        let mut flags = FrameFlags::FD;
        if brs {
            flags |= FrameFlags::BRS;
        }
        let mut frame = Self::blank(id.into(), flags, len_to_dlc(data.len(), true));
        frame.data[..data.len()].copy_from_slice(data);
        Some(frame)
    }

    /// Create an error frame carrying `error_class` in the identifier
    pub fn new_error(error_class: u32, data: &[u8]) -> Option<Self> {
        if data.len() > CAN_MAX_DLEN {
            return None;
        }
        let id = raw_to_id(error_class, error_class > CAN_SFF_MASK)?;
        let mut frame = Self::blank(id, FrameFlags::ERROR, data.len() as u8);
        frame.data[..data.len()].copy_from_slice(data);
        Some(frame)
    }

    /// Same frame with the error state indicator set (FD only)
    pub fn with_esi(mut self) -> Self {
        if self.is_fd() {
            self.flags |= FrameFlags::ESI;
        }
        self
    }

    /// Same frame with a hardware timestamp attached
    pub fn with_timestamp(mut self, timestamp_us: Option<u32>) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// Same frame tagged with a host echo ID
    pub fn with_echo_id(mut self, echo_id: Option<u32>) -> Self {
        self.echo_id = echo_id;
        self
    }

    /// CAN identifier
    pub fn id(&self) -> Id {
        self.id
    }

    /// Identifier without EFF/RTR/ERR flags
    pub fn raw_id(&self) -> u32 {
        match self.id {
            Id::Standard(id) => u32::from(id.as_raw()),
            Id::Extended(id) => id.as_raw(),
        }
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Check if this is an extended ID frame (29-bit)
    pub fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    /// Check if this is a remote transmission request
    pub fn is_remote_frame(&self) -> bool {
        self.flags.contains(FrameFlags::REMOTE)
    }

    /// Check if this is an error frame
    pub fn is_error_frame(&self) -> bool {
        self.flags.contains(FrameFlags::ERROR)
    }

    /// Check if this is a CAN FD frame
    pub fn is_fd(&self) -> bool {
        self.flags.contains(FrameFlags::FD)
    }

    /// Check if bit rate switch is enabled
    pub fn is_brs(&self) -> bool {
        self.flags.contains(FrameFlags::BRS)
    }

    /// Check if the error state indicator is set
    pub fn is_esi(&self) -> bool {
        self.flags.contains(FrameFlags::ESI)
    }

    /// Check if the device lost frames before this one
    pub fn is_overflow(&self) -> bool {
        self.flags.contains(FrameFlags::OVERFLOW)
    }

    /// Data length code as sent on the bus
    pub fn raw_dlc(&self) -> u8 {
        self.dlc
    }

    /// Data length code as a byte count request (embedded-can convention)
    pub fn dlc(&self) -> usize {
        self.dlc as usize
    }

    /// Actual payload length derived from the DLC
    pub fn data_length(&self) -> usize {
        dlc_to_len(self.dlc, self.is_fd())
    }

    /// Payload; empty for remote frames
    pub fn data(&self) -> &[u8] {
        if self.is_remote_frame() {
            &[]
        } else {
            &self.data[..self.data_length()]
        }
    }

    /// Echo ID of a transmitted frame, `None` for frames from the bus
    pub fn echo_id(&self) -> Option<u32> {
        self.echo_id
    }

    /// Check if this is an echo of a host transmission
    pub fn is_echo(&self) -> bool {
        self.echo_id.is_some()
    }

    /// Hardware timestamp in microseconds
    pub fn timestamp_us(&self) -> Option<u32> {
        self.timestamp_us
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        CanFrame::new(id, data)
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        CanFrame::new_remote(id, dlc)
    }

    fn is_extended(&self) -> bool {
        CanFrame::is_extended(self)
    }

    fn is_remote_frame(&self) -> bool {
        CanFrame::is_remote_frame(self)
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        CanFrame::data(self)
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fd_indicator = if self.is_fd() { " FD" } else { "" };
        let brs_indicator = if self.is_brs() { " BRS" } else { "" };

        let data_str = if self.is_remote_frame() {
            "remote request".to_string()
        } else {
            self.data()
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        };

        write!(
            f,
            "{:>8X}{}{}   [{}]  {}",
            self.raw_id(),
            fd_indicator,
            brs_indicator,
            self.data_length(),
            data_str
        )
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:08X}", self.raw_id()))
            .field("extended", &self.is_extended())
            .field("flags", &self.flags)
            .field("dlc", &self.dlc)
            .field("data", &self.data())
            .field("echo_id", &self.echo_id)
            .field("timestamp_us", &self.timestamp_us)
            .finish()
    }
}

fn raw_to_id(raw: u32, extended: bool) -> Option<Id> {
    if extended {
        ExtendedId::new(raw).map(Id::Extended)
    } else {
        u16::try_from(raw)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
}

/// Wire form of a frame: a [`CanFrame`] bound to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFrame {
    pub channel: u8,
    pub frame: CanFrame,
}

impl HostFrame {
    pub fn new(channel: u8, frame: CanFrame) -> Self {
        Self { channel, frame }
    }

    /// Get frame size in bytes
    pub fn frame_size(hw_timestamp: bool, fd: bool) -> usize {
        match (fd, hw_timestamp) {
            (true, true) => GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP,
            (true, false) => GS_USB_FRAME_SIZE_FD,
            (false, true) => GS_USB_FRAME_SIZE_HW_TIMESTAMP,
            (false, false) => GS_USB_FRAME_SIZE,
        }
    }

    /// Number of bytes [`HostFrame::encode`] produces
    pub fn encoded_len(&self) -> usize {
        Self::frame_size(self.frame.timestamp_us.is_some(), self.frame.is_fd())
    }

    /// Encode to `gs_host_frame` bytes
    ///
    /// The timestamp field is written only when the frame carries one.
    pub fn encode(&self) -> Vec<u8> {
        let frame = &self.frame;
        let mut buf = Vec::with_capacity(self.encoded_len());

        let mut can_id = frame.raw_id();
        if frame.is_extended() {
            can_id |= CAN_EFF_FLAG;
        }
        if frame.is_remote_frame() {
            can_id |= CAN_RTR_FLAG;
        }
        if frame.is_error_frame() {
            can_id |= CAN_ERR_FLAG;
        }

        let mut flags = 0u8;
        if frame.is_overflow() {
            flags |= GS_CAN_FLAG_OVERFLOW;
        }
        if frame.is_fd() {
            flags |= GS_CAN_FLAG_FD;
        }
        if frame.is_brs() {
            flags |= GS_CAN_FLAG_BRS;
        }
        if frame.is_esi() {
            flags |= GS_CAN_FLAG_ESI;
        }

        // Header: echo_id (4) + can_id (4) + can_dlc (1) + channel (1) + flags (1) + reserved (1)
        buf.extend_from_slice(&frame.echo_id.unwrap_or(GS_USB_RX_ECHO_ID).to_le_bytes());
        buf.extend_from_slice(&can_id.to_le_bytes());
        buf.push(frame.dlc);
        buf.push(self.channel);
        buf.push(flags);
        buf.push(0);

        let region = if frame.is_fd() {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        };
        let mut payload = [0u8; CANFD_MAX_DLEN];
        let data = frame.data();
        payload[..data.len()].copy_from_slice(data);
        buf.extend_from_slice(&payload[..region]);

        if let Some(ts) = frame.timestamp_us {
            buf.extend_from_slice(&ts.to_le_bytes());
        }

        buf
    }

    /// Decode `gs_host_frame` bytes
    ///
    /// Fails with `MalformedFrame` when the length does not match the frame
    /// kind announced by the FD flag, or when flag and identifier bits
    /// contradict each other.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GS_USB_FRAME_HEADER_SIZE {
            return Err(CandleError::MalformedFrame("shorter than frame header"));
        }

        let echo_id = le_u32(bytes, 0);
        let can_id = le_u32(bytes, 4);
        let dlc = bytes[8];
        let channel = bytes[9];
        let wire_flags = bytes[10];

        if wire_flags & GS_CAN_FLAG_RESERVED_MASK != 0 {
            return Err(CandleError::MalformedFrame("reserved flag bits set"));
        }

        let fd = wire_flags & GS_CAN_FLAG_FD != 0;
        let timestamp = if bytes.len() == Self::frame_size(false, fd) {
            false
        } else if bytes.len() == Self::frame_size(true, fd) {
            true
        } else {
            return Err(CandleError::MalformedFrame(if fd {
                "length does not match an FD frame"
            } else {
                "length does not match a classic frame"
            }));
        };

        if !fd && wire_flags & (GS_CAN_FLAG_BRS | GS_CAN_FLAG_ESI) != 0 {
            return Err(CandleError::MalformedFrame("BRS/ESI set on a classic frame"));
        }
        if fd && can_id & CAN_RTR_FLAG != 0 {
            return Err(CandleError::MalformedFrame("remote request on an FD frame"));
        }
        if dlc > CANFD_MAX_DLC {
            return Err(CandleError::MalformedFrame("DLC out of range"));
        }

        let id = raw_to_id(can_id & CAN_EFF_MASK, can_id & CAN_EFF_FLAG != 0).ok_or(
            CandleError::MalformedFrame("standard identifier uses extended bits"),
        )?;

        let mut flags = FrameFlags::empty();
        if can_id & CAN_RTR_FLAG != 0 {
            flags |= FrameFlags::REMOTE;
        }
        if can_id & CAN_ERR_FLAG != 0 {
            flags |= FrameFlags::ERROR;
        }
        if fd {
            flags |= FrameFlags::FD;
        }
        if wire_flags & GS_CAN_FLAG_BRS != 0 {
            flags |= FrameFlags::BRS;
        }
        if wire_flags & GS_CAN_FLAG_ESI != 0 {
            flags |= FrameFlags::ESI;
        }
        if wire_flags & GS_CAN_FLAG_OVERFLOW != 0 {
            flags |= FrameFlags::OVERFLOW;
        }

        let mut frame = CanFrame::blank(id, flags, dlc);
        if !frame.is_remote_frame() {
            let len = frame.data_length();
            frame.data[..len].copy_from_slice(
                &bytes[GS_USB_FRAME_HEADER_SIZE..GS_USB_FRAME_HEADER_SIZE + len],
            );
        }
        frame.echo_id = (echo_id != GS_USB_RX_ECHO_ID).then_some(echo_id);
        if timestamp {
            let offset = bytes.len() - GS_USB_TIMESTAMP_SIZE;
            frame.timestamp_us = Some(le_u32(bytes, offset));
        }

        Ok(Self { channel, frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: u16) -> StandardId {
        StandardId::new(raw).unwrap()
    }

    fn eid(raw: u32) -> ExtendedId {
        ExtendedId::new(raw).unwrap()
    }

    #[test]
    fn test_dlc_to_len_classic() {
        assert_eq!(dlc_to_len(0, false), 0);
        assert_eq!(dlc_to_len(8, false), 8);
        assert_eq!(dlc_to_len(15, false), 8); // Clamped to 8
    }

    #[test]
    fn test_dlc_to_len_fd() {
        assert_eq!(dlc_to_len(0, true), 0);
        assert_eq!(dlc_to_len(8, true), 8);
        assert_eq!(dlc_to_len(9, true), 12);
        assert_eq!(dlc_to_len(15, true), 64);
    }

    #[test]
    fn test_len_to_dlc() {
        assert_eq!(len_to_dlc(8, false), 8);
        assert_eq!(len_to_dlc(64, false), 8); // Clamped to 8
        assert_eq!(len_to_dlc(12, true), 9);
        assert_eq!(len_to_dlc(13, true), 10);
        assert_eq!(len_to_dlc(64, true), 15);
    }

    #[test]
    fn test_frame_creation() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        let frame = CanFrame::new(sid(0x7FF), &data).unwrap();

        assert_eq!(frame.raw_id(), 0x7FF);
        assert!(!frame.is_extended());
        assert!(!frame.is_fd());
        assert_eq!(frame.data_length(), 8);
        assert_eq!(frame.data(), &data);
        assert!(CanFrame::new(sid(1), &[0u8; 9]).is_none());
    }

    #[test]
    fn test_fd_frame_pads_to_valid_length() {
        let data: Vec<u8> = (0..13).collect();
        let frame = CanFrame::new_fd(eid(0x123), &data, true).unwrap();

        assert!(frame.is_extended());
        assert!(frame.is_fd());
        assert!(frame.is_brs());
        assert_eq!(frame.raw_dlc(), 10);
        assert_eq!(frame.data_length(), 16);
        assert_eq!(&frame.data()[..13], data.as_slice());
        assert_eq!(&frame.data()[13..], &[0, 0, 0]);
    }

    #[test]
    fn test_remote_frame_has_no_data() {
        let frame = CanFrame::new_remote(sid(0x100), 4).unwrap();
        assert!(frame.is_remote_frame());
        assert_eq!(frame.dlc(), 4);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn test_encode_classic_layout() {
        let frame = CanFrame::new(eid(0x1234_5678), &[0xAA, 0xBB]).unwrap();
        let bytes = HostFrame::new(1, frame).encode();

        assert_eq!(bytes.len(), GS_USB_FRAME_SIZE);
        assert_eq!(bytes[0..4], [0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(bytes[4..8], (0x1234_5678u32 | CAN_EFF_FLAG).to_le_bytes());
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[9], 1);
        assert_eq!(bytes[10], 0);
        assert_eq!(bytes[11], 0);
        assert_eq!(bytes[12..20], [0xAA, 0xBB, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_fd_with_timestamp() {
        let frame = CanFrame::new_fd(sid(0x10), &[1; 64], true)
            .unwrap()
            .with_echo_id(Some(7))
            .with_timestamp(Some(0xDEAD_BEEF));
        let bytes = HostFrame::new(0, frame).encode();

        assert_eq!(bytes.len(), GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP);
        assert_eq!(bytes[0..4], [7, 0, 0, 0]);
        assert_eq!(bytes[10], GS_CAN_FLAG_FD | GS_CAN_FLAG_BRS);
        assert_eq!(bytes[76..80], 0xDEAD_BEEFu32.to_le_bytes());
    }

    #[test]
    fn test_decode_roundtrip_classic() {
        let frame = CanFrame::new(sid(0x7FF), &[1, 2, 3]).unwrap();
        let host = HostFrame::new(0, frame);
        let decoded = HostFrame::decode(&host.encode()).unwrap();
        assert_eq!(decoded, host);
        assert_eq!(decoded.frame.echo_id(), None);
    }

    #[test]
    fn test_decode_rx_with_timestamp() {
        let mut bytes = vec![0u8; GS_USB_FRAME_SIZE_HW_TIMESTAMP];
        bytes[0..4].copy_from_slice(&GS_USB_RX_ECHO_ID.to_le_bytes());
        bytes[4..8].copy_from_slice(&0x123u32.to_le_bytes());
        bytes[8] = 1;
        bytes[12] = 0x55;
        bytes[20..24].copy_from_slice(&1000u32.to_le_bytes());

        let host = HostFrame::decode(&bytes).unwrap();
        assert_eq!(host.frame.raw_id(), 0x123);
        assert_eq!(host.frame.data(), &[0x55]);
        assert_eq!(host.frame.timestamp_us(), Some(1000));
        assert_eq!(host.encode(), bytes);
    }

    #[test]
    fn test_decode_error_frame() {
        let frame = CanFrame::new_error(0x40, &[0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let bytes = HostFrame::new(0, frame).encode();
        assert_eq!(bytes[4..8], (0x40u32 | CAN_ERR_FLAG).to_le_bytes());
        let decoded = HostFrame::decode(&bytes).unwrap();
        assert!(decoded.frame.is_error_frame());
        assert_eq!(decoded.frame.raw_id(), 0x40);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert_eq!(
            HostFrame::decode(&[1, 2, 3]),
            Err(CandleError::MalformedFrame("shorter than frame header"))
        );
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let bytes = HostFrame::new(0, CanFrame::new(sid(1), &[]).unwrap()).encode();
        assert!(HostFrame::decode(&bytes[..19]).is_err());

        // classic header with an FD-sized body
        let mut long = bytes.clone();
        long.resize(GS_USB_FRAME_SIZE_FD, 0);
        assert!(HostFrame::decode(&long).is_err());
    }

    #[test]
    fn test_decode_rejects_inconsistent_bits() {
        let base = HostFrame::new(0, CanFrame::new(sid(1), &[]).unwrap()).encode();

        let mut reserved = base.clone();
        reserved[10] = 0x10;
        assert!(HostFrame::decode(&reserved).is_err());

        let mut brs_classic = base.clone();
        brs_classic[10] = GS_CAN_FLAG_BRS;
        assert!(HostFrame::decode(&brs_classic).is_err());

        let mut wide_std_id = base.clone();
        wide_std_id[4..8].copy_from_slice(&0x800u32.to_le_bytes());
        assert!(HostFrame::decode(&wide_std_id).is_err());

        let mut fd_remote =
            HostFrame::new(0, CanFrame::new_fd(sid(1), &[], false).unwrap()).encode();
        fd_remote[4..8].copy_from_slice(&(1u32 | CAN_RTR_FLAG).to_le_bytes());
        assert!(HostFrame::decode(&fd_remote).is_err());
    }

    #[test]
    fn test_classic_dlc_above_eight_preserved() {
        let mut bytes = HostFrame::new(0, CanFrame::new(sid(1), &[9; 8]).unwrap()).encode();
        bytes[8] = 12;
        let decoded = HostFrame::decode(&bytes).unwrap();
        assert_eq!(decoded.frame.raw_dlc(), 12);
        assert_eq!(decoded.frame.data_length(), 8);
        assert_eq!(decoded.encode(), bytes);
    }
}
