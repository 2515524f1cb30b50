//! Host-side driver for gs_usb CAN adapters
//!
//! This crate talks to candleLight, CANable and other adapters running
//! gs_usb-compatible firmware. One device may expose several CAN channels;
//! each channel is configured, started and stopped on its own, while all of
//! them share the adapter's bulk endpoints.
//!
//! # Features
//!
//! - Classic CAN and CAN FD (with bit rate switching)
//! - Bit timing from a bitrate and sample point, validated against the
//!   limits the device reports
//! - Hardware timestamps, listen-only, loopback, one-shot modes
//! - Bus state and error counters, termination and identify LED control
//! - A pluggable USB transport: libusb via `rusb`, or an in-memory mock
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use candle_driver::{CanFrame, DeviceManager, ModeFlags};
//! use embedded_can::StandardId;
//!
//! fn main() -> candle_driver::Result<()> {
//!     let manager = DeviceManager::rusb();
//!     let Some(descriptor) = manager.enumerate()?.next() else {
//!         println!("No gs_usb device found");
//!         return Ok(());
//!     };
//!
//!     let device = manager.open(&descriptor)?;
//!     let channel = device.channel(0)?;
//!     channel.set_bitrate(250_000)?;
//!     channel.start(ModeFlags::NORMAL)?;
//!
//!     let id = StandardId::new(0x123).unwrap();
//!     let frame = CanFrame::new(id, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
//!     channel.send(&frame)?;
//!
//!     while let Some(frame) = channel.receive(Some(Duration::from_secs(1)))? {
//!         println!("RX  {}", frame);
//!     }
//!     channel.stop()
//! }
//! ```
//!
//! # Supported Devices
//!
//! - GS-USB devices (VID: 0x1D50, PID: 0x606F)
//! - candleLight (VID: 0x1209, PID: 0x2323)
//! - CES CANext FD (VID: 0x1CD2, PID: 0x606F)
//! - ABE CANdebugger FD (VID: 0x16D0, PID: 0x10B8)

pub mod channel;
pub mod config;
pub mod constants;
pub mod control;
pub mod device;
pub mod error;
pub mod fifo;
pub mod frame;
pub mod structures;
pub mod timing;
pub mod transport;

// Re-export main types at crate root
pub use channel::{Channel, ChannelState, ChannelStats};
pub use config::{DeviceOptions, RxOverflow};
pub use device::{Device, DeviceInfo, DeviceManager, DeviceStats, Enumeration};
pub use error::{CandleError, Result, TransportError};
pub use frame::{CanFrame, FrameFlags, HostFrame};
pub use structures::{
    BitTiming, BitTimingConst, CanState, DeviceConfig, DeviceMode, DeviceState, Features,
    ModeFlags, TimingLimits,
};
pub use transport::{DeviceAvailability, DeviceDescriptor};
