//! Channel Start Sequence Example (CAN FD)
//!
//! Runs the CAN FD start sequence on channel 0:
//!
//! 1. BITTIMING - nominal (arbitration) phase at 1 Mbps
//! 2. DATA_BITTIMING - data phase at 5 Mbps
//! 3. MODE - start with FD, plus HW_TIMESTAMP when available
//!
//! The channel runs in loopback when the device supports it, so a few
//! frames can be exchanged without a bus.

use std::time::Duration;

use candle_driver::{CanFrame, DeviceManager, Features, ModeFlags};
use embedded_can::StandardId;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> candle_driver::Result<()> {
    println!("Scanning for gs_usb devices...");
    let manager = DeviceManager::rusb();
    let Some(descriptor) = manager.enumerate()?.next() else {
        println!("Can not find gs_usb device");
        return Ok(());
    };

    let device = manager.open(&descriptor)?;
    println!("Found device: {}", device);
    let channel = device.channel(0)?;

    if !channel.supports_fd() {
        println!("ERROR: Device does not support CAN FD!");
        return Ok(());
    }
    if let Some(data) = channel.capabilities().data {
        println!(
            "Data phase limits: TSEG1 {}-{}, TSEG2 {}-{}, BRP {}-{}",
            data.tseg1_min, data.tseg1_max, data.tseg2_min, data.tseg2_max, data.brp_min,
            data.brp_max
        );
    }

    println!("=== Step 1: BITTIMING ===");
    channel.set_bitrate(1_000_000)?;
    if let Some(timing) = channel.bit_timing() {
        println!(
            "Nominal: brp={} tq={} sample point {:.1}%",
            timing.brp,
            timing.time_quanta(),
            timing.sample_point()
        );
    }

    println!("=== Step 2: DATA_BITTIMING ===");
    channel.set_data_bitrate(5_000_000)?;
    if let Some(timing) = channel.data_bit_timing() {
        println!(
            "Data: brp={} tq={} sample point {:.1}%",
            timing.brp,
            timing.time_quanta(),
            timing.sample_point()
        );
    }

    println!("=== Step 3: MODE ===");
    let features = channel.features();
    let mut flags = ModeFlags::FD;
    if features.contains(Features::HW_TIMESTAMP) {
        flags |= ModeFlags::HW_TIMESTAMP;
    }
    if features.contains(Features::LOOP_BACK) {
        flags |= ModeFlags::LOOP_BACK;
    }
    channel.start(flags)?;
    println!("Channel started with {:?}", flags);

    for (i, len) in [8usize, 12, 32, 64].into_iter().enumerate() {
        let payload: Vec<u8> = (0..len as u8).collect();
        let id = StandardId::new(0x100 + i as u16).unwrap_or(StandardId::ZERO);
        if let Some(frame) = CanFrame::new_fd(id, &payload, true) {
            let echo = channel.send(&frame)?;
            println!("TX  {} (echo {})", frame, echo);
        }
    }

    while let Some(frame) = channel.receive(Some(Duration::from_millis(500)))? {
        println!("RX  {}", frame);
    }

    channel.stop()?;
    println!("Channel stopped");
    Ok(())
}
