//! Typed gs_usb control requests
//!
//! Every request is a vendor control transfer addressed to the claimed
//! interface, with the channel index in `wValue`. Responses whose size
//! differs from the expected structure fail with
//! [`CandleError::Protocol`]. Nothing is retried.

use std::time::Duration;

use log::trace;

use crate::constants::{
    request_name, GS_CAN_IDENTIFY_OFF, GS_CAN_IDENTIFY_ON, GS_CAN_TERMINATION_STATE_OFF,
    GS_CAN_TERMINATION_STATE_ON, GS_USB_BREQ_BITTIMING, GS_USB_BREQ_BT_CONST,
    GS_USB_BREQ_BT_CONST_EXT, GS_USB_BREQ_DATA_BITTIMING, GS_USB_BREQ_DEVICE_CONFIG,
    GS_USB_BREQ_GET_STATE, GS_USB_BREQ_GET_TERMINATION, GS_USB_BREQ_GET_USER_ID,
    GS_USB_BREQ_HOST_FORMAT, GS_USB_BREQ_IDENTIFY, GS_USB_BREQ_MODE,
    GS_USB_BREQ_SET_TERMINATION, GS_USB_BREQ_SET_USER_ID, GS_USB_BREQ_TIMESTAMP,
    GS_USB_HOST_FORMAT,
};
use crate::error::{CandleError, Result};
use crate::structures::{
    le_u32, BitTiming, BitTimingConst, DeviceConfig, DeviceMode, DeviceState,
};
use crate::transport::{ControlSetup, UsbHandle};

/// Control request issuer bound to an open handle
pub struct Control<'a> {
    handle: &'a dyn UsbHandle,
    interface: u16,
    timeout: Duration,
}

impl<'a> Control<'a> {
    pub fn new(handle: &'a dyn UsbHandle, interface: u8, timeout: Duration) -> Self {
        Self {
            handle,
            interface: u16::from(interface),
            timeout,
        }
    }

    /// Perform a control OUT transfer
    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<()> {
        let setup = ControlSetup::vendor_out(request, value, self.interface);
        let written = self.handle.control_out(setup, data, self.timeout)?;
        trace!("{} wValue={} -> {} bytes", request_name(request), value, written);

        if written != data.len() {
            return Err(CandleError::Protocol {
                request,
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }

    /// Perform a control IN transfer
    fn control_in(&self, request: u8, value: u16, length: usize) -> Result<Vec<u8>> {
        let setup = ControlSetup::vendor_in(request, value, self.interface);
        let mut buf = vec![0u8; length];
        let read = self.handle.control_in(setup, &mut buf, self.timeout)?;
        trace!("{} wValue={} <- {} bytes", request_name(request), value, read);

        if read != length {
            return Err(CandleError::Protocol {
                request,
                expected: length,
                actual: read,
            });
        }
        Ok(buf)
    }

    fn read_u32(&self, request: u8, value: u16) -> Result<u32> {
        let data = self.control_in(request, value, 4)?;
        Ok(le_u32(&data, 0))
    }

    /// Send the host byte-order marker
    ///
    /// Legacy request; current firmware ignores it and some reject it.
    pub fn host_format(&self) -> Result<()> {
        self.control_out(GS_USB_BREQ_HOST_FORMAT, 0, &GS_USB_HOST_FORMAT.to_le_bytes())
    }

    pub fn get_device_config(&self) -> Result<DeviceConfig> {
        let data = self.control_in(GS_USB_BREQ_DEVICE_CONFIG, 0, DeviceConfig::SIZE)?;
        DeviceConfig::decode(&data)
    }

    /// Nominal timing constraints and feature bits of a channel
    pub fn get_bit_timing_consts(&self, channel: u16) -> Result<BitTimingConst> {
        let data = self.control_in(GS_USB_BREQ_BT_CONST, channel, BitTimingConst::SIZE)?;
        BitTimingConst::decode(&data)
    }

    /// Nominal and data phase timing constraints of a channel
    pub fn get_bit_timing_consts_ext(&self, channel: u16) -> Result<BitTimingConst> {
        let data = self.control_in(
            GS_USB_BREQ_BT_CONST_EXT,
            channel,
            BitTimingConst::SIZE_EXT,
        )?;
        BitTimingConst::decode_extended(&data)
    }

    pub fn set_bit_timing(&self, channel: u16, timing: &BitTiming) -> Result<()> {
        self.control_out(GS_USB_BREQ_BITTIMING, channel, &timing.encode())
    }

    pub fn set_data_bit_timing(&self, channel: u16, timing: &BitTiming) -> Result<()> {
        self.control_out(GS_USB_BREQ_DATA_BITTIMING, channel, &timing.encode())
    }

    pub fn set_mode(&self, channel: u16, mode: &DeviceMode) -> Result<()> {
        self.control_out(GS_USB_BREQ_MODE, channel, &mode.encode())
    }

    pub fn set_termination(&self, channel: u16, enabled: bool) -> Result<()> {
        let state = if enabled {
            GS_CAN_TERMINATION_STATE_ON
        } else {
            GS_CAN_TERMINATION_STATE_OFF
        };
        self.control_out(GS_USB_BREQ_SET_TERMINATION, channel, &state.to_le_bytes())
    }

    pub fn get_termination(&self, channel: u16) -> Result<bool> {
        Ok(self.read_u32(GS_USB_BREQ_GET_TERMINATION, channel)? != GS_CAN_TERMINATION_STATE_OFF)
    }

    pub fn get_state(&self, channel: u16) -> Result<DeviceState> {
        let data = self.control_in(GS_USB_BREQ_GET_STATE, channel, DeviceState::SIZE)?;
        DeviceState::decode(&data)
    }

    /// Start or stop blinking the channel LED
    pub fn set_identify(&self, channel: u16, enabled: bool) -> Result<()> {
        let mode = if enabled {
            GS_CAN_IDENTIFY_ON
        } else {
            GS_CAN_IDENTIFY_OFF
        };
        self.control_out(GS_USB_BREQ_IDENTIFY, channel, &mode.to_le_bytes())
    }

    /// Current device timestamp in microseconds
    pub fn get_timestamp(&self) -> Result<u32> {
        self.read_u32(GS_USB_BREQ_TIMESTAMP, 0)
    }

    pub fn get_user_id(&self) -> Result<u32> {
        self.read_u32(GS_USB_BREQ_GET_USER_ID, 0)
    }

    pub fn set_user_id(&self, user_id: u32) -> Result<()> {
        self.control_out(GS_USB_BREQ_SET_USER_ID, 0, &user_id.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::structures::{Features, ModeFlags};
    use crate::transport::mock::{MockDevice, MockTransport};
    use crate::transport::UsbTransport;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn open(device: MockDevice) -> (Box<dyn UsbHandle>, crate::transport::mock::MockControl) {
        let transport = MockTransport::new();
        let descriptor = device.descriptor().clone();
        let control = transport.add(device);
        let handle = transport.open(&descriptor, 0).unwrap();
        (handle, control)
    }

    #[test]
    fn test_device_config() {
        let (handle, _mock) = open(MockDevice::new().with_channels(2).with_versions(21, 10));
        let config = Control::new(handle.as_ref(), 0, TIMEOUT)
            .get_device_config()
            .unwrap();
        assert_eq!(config.channel_count(), 2);
        assert_eq!(config.sw_version, 21);
    }

    #[test]
    fn test_set_mode_addresses_channel_and_interface() {
        let (handle, mock) = open(MockDevice::new().with_channels(2));
        let control = Control::new(handle.as_ref(), 0, TIMEOUT);
        control
            .set_mode(1, &DeviceMode::start(ModeFlags::LOOP_BACK))
            .unwrap();

        let record = mock.control_requests().pop().unwrap();
        assert_eq!(record.setup, ControlSetup::vendor_out(GS_USB_BREQ_MODE, 1, 0));
        assert_eq!(record.data.len(), DeviceMode::SIZE);
        assert_eq!(
            mock.mode(1),
            Some(DeviceMode::start(ModeFlags::LOOP_BACK))
        );
    }

    #[test]
    fn test_short_response_is_protocol_error() {
        let (handle, mock) = open(MockDevice::new());
        mock.set_response(GS_USB_BREQ_BT_CONST, &[0u8; 12]);
        let err = Control::new(handle.as_ref(), 0, TIMEOUT)
            .get_bit_timing_consts(0)
            .unwrap_err();
        assert_eq!(
            err,
            CandleError::Protocol {
                request: GS_USB_BREQ_BT_CONST,
                expected: 40,
                actual: 12
            }
        );
    }

    #[test]
    fn test_transport_error_passes_through() {
        let (handle, mock) = open(MockDevice::new());
        mock.set_failure(GS_USB_BREQ_DEVICE_CONFIG, TransportError::Timeout);
        let err = Control::new(handle.as_ref(), 0, TIMEOUT)
            .get_device_config()
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_extended_constants() {
        let (handle, _mock) = open(
            MockDevice::new().with_features(Features::FD | Features::BT_CONST_EXT),
        );
        let caps = Control::new(handle.as_ref(), 0, TIMEOUT)
            .get_bit_timing_consts_ext(0)
            .unwrap();
        assert!(caps.has_fd_timing());
        assert!(caps.features.contains(Features::FD));
    }

    #[test]
    fn test_termination_roundtrip() {
        let (handle, _mock) = open(MockDevice::new().with_features(Features::TERMINATION));
        let control = Control::new(handle.as_ref(), 0, TIMEOUT);
        assert!(!control.get_termination(0).unwrap());
        control.set_termination(0, true).unwrap();
        assert!(control.get_termination(0).unwrap());
    }
}
