//! Driver options
//!
//! [`DeviceOptions`] is passed to [`crate::DeviceManager::with_options`] and
//! applies to every device opened through that manager.

use std::time::Duration;

use crate::constants::{
    DEFAULT_CONTROL_TIMEOUT, DEFAULT_DRAIN_TIMEOUT, DEFAULT_RX_FIFO_CAPACITY,
    DEFAULT_RX_TRANSFERS, DEFAULT_TRANSMIT_TIMEOUT, DEFAULT_TX_CAPACITY,
    GS_USB_FRAME_SIZE, GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP,
};
use crate::error::{CandleError, Result};

/// What happens to a received frame when the channel FIFO is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxOverflow {
    /// Discard the incoming frame
    #[default]
    DropNewest,
    /// Evict the oldest queued frame to make room
    DropOldest,
}

/// Options applied when opening a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    /// USB interface to claim
    pub interface: u8,
    /// Receive transfers kept in flight while any channel runs
    pub rx_transfers: usize,
    /// Size of each receive buffer
    pub rx_buffer_size: usize,
    /// Frames buffered per channel
    pub rx_fifo_capacity: usize,
    /// Transmits in flight per channel before `send` reports `QueueFull`
    pub tx_capacity: usize,
    pub control_timeout: Duration,
    pub transmit_timeout: Duration,
    /// Upper bound on waiting for cancelled transfers on stop and close
    pub drain_timeout: Duration,
    pub rx_overflow: RxOverflow,
    /// Queue echoes of our own transmissions alongside received frames
    pub receive_echo: bool,
    /// Send the legacy HOST_FORMAT request on open
    pub send_host_format: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            interface: 0,
            rx_transfers: DEFAULT_RX_TRANSFERS,
            rx_buffer_size: GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP,
            rx_fifo_capacity: DEFAULT_RX_FIFO_CAPACITY,
            tx_capacity: DEFAULT_TX_CAPACITY,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            rx_overflow: RxOverflow::DropNewest,
            receive_echo: false,
            send_host_format: true,
        }
    }
}

impl DeviceOptions {
    pub fn with_interface(mut self, interface: u8) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_rx_transfers(mut self, count: usize) -> Self {
        self.rx_transfers = count;
        self
    }

    pub fn with_rx_buffer_size(mut self, size: usize) -> Self {
        self.rx_buffer_size = size;
        self
    }

    pub fn with_rx_fifo_capacity(mut self, capacity: usize) -> Self {
        self.rx_fifo_capacity = capacity;
        self
    }

    pub fn with_tx_capacity(mut self, capacity: usize) -> Self {
        self.tx_capacity = capacity;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn with_transmit_timeout(mut self, timeout: Duration) -> Self {
        self.transmit_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_rx_overflow(mut self, policy: RxOverflow) -> Self {
        self.rx_overflow = policy;
        self
    }

    pub fn with_receive_echo(mut self, enabled: bool) -> Self {
        self.receive_echo = enabled;
        self
    }

    pub fn with_host_format(mut self, enabled: bool) -> Self {
        self.send_host_format = enabled;
        self
    }

    /// Reject option values no device could work with
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("rx_transfers", self.rx_transfers),
            ("rx_fifo_capacity", self.rx_fifo_capacity),
            ("tx_capacity", self.tx_capacity),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(CandleError::invalid_parameter(
                    name,
                    0u64,
                    "must be at least 1",
                ));
            }
        }
        if self.rx_buffer_size < GS_USB_FRAME_SIZE {
            return Err(CandleError::invalid_parameter(
                "rx_buffer_size",
                self.rx_buffer_size as u64,
                format!("must hold a {}-byte classic frame", GS_USB_FRAME_SIZE),
            ));
        }
        Ok(())
    }
}
