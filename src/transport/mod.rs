//! USB transport abstraction
//!
//! The driver talks to hardware only through [`UsbTransport`] and
//! [`UsbHandle`]. Bulk transfers are asynchronous: [`UsbHandle::submit`]
//! hands over an owned [`Transfer`] and the transport returns it inside a
//! [`Completion`] delivered to a [`CompletionSink`], from whatever thread
//! the transport uses.
//!
//! Two backends ship with the crate:
//! - [`libusb::RusbTransport`] for real adapters through libusb
//! - [`mock::MockTransport`], an in-memory device for tests and demos

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{GS_USB_REQ_TYPE_IN, GS_USB_REQ_TYPE_OUT};
use crate::error::TransportError;

pub mod libusb;
pub mod mock;

/// A USB device as seen during enumeration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    /// Hub port path from the root
    pub port_numbers: Vec<u8>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl DeviceDescriptor {
    /// Check whether `vendor_id:product_id` is in `ids`
    pub fn matches(&self, ids: &[(u16, u16)]) -> bool {
        ids.contains(&(self.vendor_id, self.product_id))
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GS-USB {:04x}:{:04x} (bus {}, addr {})",
            self.vendor_id, self.product_id, self.bus, self.address
        )?;
        if let Some(serial) = &self.serial {
            write!(f, " serial {}", serial)?;
        }
        Ok(())
    }
}

/// Whether a device can be opened right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAvailability {
    Available,
    /// Another handle holds the interface
    InUse,
}

impl DeviceAvailability {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceAvailability::Available => "available",
            DeviceAvailability::InUse => "in use",
        }
    }
}

impl fmt::Display for DeviceAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Setup packet of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Vendor request, interface recipient, device-to-host
    pub fn vendor_in(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: GS_USB_REQ_TYPE_IN,
            request,
            value,
            index,
        }
    }

    /// Vendor request, interface recipient, host-to-device
    pub fn vendor_out(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: GS_USB_REQ_TYPE_OUT,
            request,
            value,
            index,
        }
    }
}

/// What a bulk transfer is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Bulk IN read into the buffer
    Receive,
    /// Bulk OUT write of the buffer for a channel
    Transmit { channel: u8, echo_id: u32 },
}

/// An owned bulk transfer
///
/// For receives `buffer.len()` is the maximum read size; for transmits it is
/// exactly the bytes to send.
#[derive(Debug)]
pub struct Transfer {
    pub endpoint: u8,
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    /// Zero waits until completion or cancellation
    pub timeout: Duration,
}

impl Transfer {
    pub fn receive(endpoint: u8, buffer: Vec<u8>) -> Self {
        Self {
            endpoint,
            kind: TransferKind::Receive,
            buffer,
            timeout: Duration::ZERO,
        }
    }

    pub fn transmit(
        endpoint: u8,
        channel: u8,
        echo_id: u32,
        buffer: Vec<u8>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            kind: TransferKind::Transmit { channel, echo_id },
            buffer,
            timeout,
        }
    }
}

/// A finished transfer, handed back with its buffer
#[derive(Debug)]
pub struct Completion {
    pub transfer: Transfer,
    /// Bytes actually transferred
    pub actual_len: usize,
    pub status: Result<(), TransportError>,
}

impl Completion {
    /// Bytes received (or sent)
    pub fn data(&self) -> &[u8] {
        let len = self.actual_len.min(self.transfer.buffer.len());
        &self.transfer.buffer[..len]
    }
}

/// Receiver of transfer completions
pub trait CompletionSink: Send + Sync {
    /// Called exactly once per submitted transfer
    fn on_complete(&self, completion: Completion);
}

/// An opened device with its interface claimed
///
/// Dropping the handle releases the interface.
pub trait UsbHandle: Send + Sync {
    /// Control transfer, device-to-host; returns bytes read
    fn control_in(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Control transfer, host-to-device; returns bytes written
    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Queue a bulk transfer
    ///
    /// On success `sink` receives exactly one completion for it. On error the
    /// transfer is dropped and no completion follows.
    fn submit(&self, transfer: Transfer, sink: Arc<dyn CompletionSink>)
        -> Result<(), TransportError>;

    /// Cancel every queued transfer; each completes with `Cancelled`
    fn cancel_all(&self);
}

/// Source of USB devices
pub trait UsbTransport: Send + Sync {
    /// List attached devices
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open a device, detach any kernel driver and claim `interface`
    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        interface: u8,
    ) -> Result<Box<dyn UsbHandle>, TransportError>;

    /// Check whether `interface` could be claimed without claiming it
    fn availability(
        &self,
        descriptor: &DeviceDescriptor,
        interface: u8,
    ) -> Result<DeviceAvailability, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_display() {
        let desc = DeviceDescriptor {
            vendor_id: 0x1d50,
            product_id: 0x606f,
            bus: 1,
            address: 7,
            serial: Some("ABC".into()),
            ..Default::default()
        };
        assert_eq!(desc.to_string(), "GS-USB 1d50:606f (bus 1, addr 7) serial ABC");
        assert!(desc.matches(&[(0x1d50, 0x606f)]));
        assert!(!desc.matches(&[(0x1209, 0x2323)]));
    }

    #[test]
    fn test_setup_request_types() {
        assert_eq!(ControlSetup::vendor_in(5, 0, 0).request_type, 0xC1);
        assert_eq!(ControlSetup::vendor_out(2, 1, 0).request_type, 0x41);
    }

    #[test]
    fn test_completion_data_clamped() {
        let completion = Completion {
            transfer: Transfer::receive(0x81, vec![1, 2, 3, 4]),
            actual_len: 2,
            status: Ok(()),
        };
        assert_eq!(completion.data(), &[1, 2]);
    }
}
