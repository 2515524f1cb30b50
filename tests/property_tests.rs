//! Property-based tests for frame coding, bit timing and FIFO ordering.

use candle_driver::constants::{
    CAN_EFF_FLAG, CAN_ERR_FLAG, CAN_RTR_FLAG, GS_CAN_FLAG_BRS, GS_CAN_FLAG_ESI, GS_CAN_FLAG_FD,
    GS_CAN_FLAG_OVERFLOW,
};
use candle_driver::fifo::Fifo;
use candle_driver::frame::{dlc_to_len, len_to_dlc};
use candle_driver::timing::{calc_bit_timing, validate};
use candle_driver::{CanFrame, HostFrame, TimingLimits};
use embedded_can::{ExtendedId, Id, StandardId};
use proptest::prelude::*;

fn stm32_limits() -> TimingLimits {
    TimingLimits {
        tseg1_min: 1,
        tseg1_max: 16,
        tseg2_min: 1,
        tseg2_max: 8,
        sjw_max: 4,
        brp_min: 1,
        brp_max: 1024,
        brp_inc: 1,
    }
}

prop_compose! {
    /// Identifier as (extended, raw id)
    fn any_raw_id()(extended: bool, raw in 0u32..=0x1FFF_FFFF) -> (bool, u32) {
        (extended, if extended { raw } else { raw & 0x7FF })
    }
}

prop_compose! {
    /// Every well-formed `gs_host_frame` layout
    fn wire_bytes()(
        (extended, raw) in any_raw_id(),
        kind in 0u8..3,
        fd: bool,
        brs: bool,
        esi: bool,
        overflow: bool,
        dlc in 0u8..=15,
        echo_id: u32,
        channel: u8,
        timestamp: Option<u32>,
        payload in proptest::collection::vec(any::<u8>(), 64),
    ) -> Vec<u8> {
        // 0 data, 1 remote, 2 error; FD has no remote frames
        let remote = kind == 1 && !fd;
        let mut can_id = raw;
        if extended {
            can_id |= CAN_EFF_FLAG;
        }
        if remote {
            can_id |= CAN_RTR_FLAG;
        }
        if kind == 2 {
            can_id |= CAN_ERR_FLAG;
        }

        let mut flags = 0u8;
        if overflow {
            flags |= GS_CAN_FLAG_OVERFLOW;
        }
        if fd {
            flags |= GS_CAN_FLAG_FD;
            if brs {
                flags |= GS_CAN_FLAG_BRS;
            }
            if esi {
                flags |= GS_CAN_FLAG_ESI;
            }
        }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&echo_id.to_le_bytes());
        bytes.extend_from_slice(&can_id.to_le_bytes());
        bytes.extend_from_slice(&[dlc, channel, flags, 0]);

        let region = if fd { 64 } else { 8 };
        let used = if remote { 0 } else { dlc_to_len(dlc, fd) };
        for (i, &b) in payload[..region].iter().enumerate() {
            bytes.push(if i < used { b } else { 0 });
        }
        if let Some(ts) = timestamp {
            bytes.extend_from_slice(&ts.to_le_bytes());
        }
        bytes
    }
}

prop_compose! {
    /// Frames built through the public constructors
    fn any_frame()(
        (extended, raw) in any_raw_id(),
        kind in 0u8..4,
        data in proptest::collection::vec(any::<u8>(), 0..=64),
        brs: bool,
        esi: bool,
        timestamp: Option<u32>,
        echo_id in proptest::option::of(0u32..u32::MAX),
    ) -> CanFrame {
        let id: Id = if extended {
            ExtendedId::new(raw).unwrap().into()
        } else {
            StandardId::new(raw as u16).unwrap().into()
        };
        let classic = &data[..data.len().min(8)];
        let frame = match kind {
            0 => CanFrame::new(id, classic).unwrap(),
            1 => CanFrame::new_remote(id, data.len() % 9).unwrap(),
            2 => CanFrame::new_error(raw, classic).unwrap(),
            _ => {
                let frame = CanFrame::new_fd(id, &data, brs).unwrap();
                if esi { frame.with_esi() } else { frame }
            }
        };
        frame.with_timestamp(timestamp).with_echo_id(echo_id)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Well-formed wire bytes decode and re-encode to the same bytes.
    #[test]
    fn prop_wire_bytes_roundtrip(bytes in wire_bytes()) {
        let host = HostFrame::decode(&bytes).unwrap();
        prop_assert_eq!(host.encoded_len(), bytes.len());
        prop_assert_eq!(host.encode(), bytes.clone());

        let can_id = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let frame = host.frame;
        prop_assert_eq!(frame.is_extended(), can_id & CAN_EFF_FLAG != 0);
        prop_assert_eq!(frame.is_remote_frame(), can_id & CAN_RTR_FLAG != 0);
        prop_assert_eq!(frame.is_error_frame(), can_id & CAN_ERR_FLAG != 0);
        prop_assert_eq!(frame.is_overflow(), bytes[10] & GS_CAN_FLAG_OVERFLOW != 0);
        prop_assert_eq!(frame.is_fd(), bytes[10] & GS_CAN_FLAG_FD != 0);
        prop_assert_eq!(frame.is_esi(), bytes[10] & GS_CAN_FLAG_ESI != 0);
        prop_assert_eq!(frame.raw_dlc(), bytes[8]);
        prop_assert_eq!(host.channel, bytes[9]);
    }

    /// Constructed frames of every kind survive encode then decode.
    #[test]
    fn prop_frame_roundtrip(frame in any_frame(), channel: u8) {
        let host = HostFrame::new(channel, frame);
        let bytes = host.encode();
        prop_assert_eq!(bytes.len(), host.encoded_len());
        let decoded = HostFrame::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, host);
        prop_assert_eq!(decoded.encode(), bytes);
    }

    /// Arbitrary bytes either decode or fail cleanly.
    #[test]
    fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..100)) {
        let _ = HostFrame::decode(&bytes);
    }

    /// Classic frames survive the wire format unchanged.
    #[test]
    fn prop_classic_frame_roundtrip(
        id in 0u16..=0x7FF,
        data in proptest::collection::vec(any::<u8>(), 0..=8),
        channel: u8,
        timestamp: Option<u32>,
    ) {
        let frame = CanFrame::new(StandardId::new(id).unwrap(), &data)
            .unwrap()
            .with_timestamp(timestamp);
        let host = HostFrame::new(channel, frame);
        let bytes = host.encode();
        prop_assert_eq!(bytes.len(), host.encoded_len());
        prop_assert_eq!(HostFrame::decode(&bytes).unwrap(), host);
    }

    /// FD payloads come back padded to a valid DLC length with the prefix intact.
    #[test]
    fn prop_fd_frame_payload(
        id in 0u32..=0x1FFF_FFFF,
        data in proptest::collection::vec(any::<u8>(), 0..=64),
        brs: bool,
    ) {
        let frame = CanFrame::new_fd(ExtendedId::new(id).unwrap(), &data, brs).unwrap();
        let decoded = HostFrame::decode(&HostFrame::new(0, frame).encode()).unwrap().frame;
        prop_assert_eq!(decoded.raw_id(), id);
        prop_assert_eq!(decoded.is_brs(), brs);
        prop_assert!(decoded.data().len() >= data.len());
        prop_assert_eq!(&decoded.data()[..data.len()], &data[..]);
    }

    /// The FD DLC always covers the requested length.
    #[test]
    fn prop_fd_dlc_covers_length(len in 0usize..=64) {
        let dlc = len_to_dlc(len, true);
        prop_assert!(dlc <= 15);
        prop_assert!(dlc_to_len(dlc, true) >= len);
    }

    /// Computed timings respect device limits and land within 0.5%.
    #[test]
    fn prop_calculated_timing_is_valid(
        bitrate in 10_000u32..=1_000_000,
        sample_point in 1.0f32..99.0,
    ) {
        let limits = stm32_limits();
        if let Ok(timing) = calc_bit_timing(bitrate, sample_point, 48_000_000, &limits) {
            prop_assert!(validate(&timing, &limits).is_ok());
            let actual = timing.bitrate(48_000_000);
            prop_assert!(f64::from(actual.abs_diff(bitrate)) <= f64::from(bitrate) * 0.005);
        }
    }

    /// A FIFO hands items back in insertion order and keeps only what fits.
    #[test]
    fn prop_fifo_preserves_order(
        capacity in 1usize..32,
        items in proptest::collection::vec(any::<u32>(), 0..64),
    ) {
        let mut fifo = Fifo::with_capacity(capacity);
        for &item in &items {
            fifo.push(item);
        }
        let kept: Vec<u32> = fifo.drain().collect();
        let expected: Vec<u32> = items.iter().copied().take(capacity).collect();
        prop_assert_eq!(kept, expected);
    }
}
