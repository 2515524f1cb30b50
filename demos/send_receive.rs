//! Send and Receive Example
//!
//! Opens the first gs_usb device, starts channel 0 at 500 kbps and sends a
//! frame once per second while printing everything received. Stops after
//! ten seconds and prints the channel counters.

use std::time::{Duration, Instant};

use candle_driver::{CanFrame, CandleError, DeviceManager, DeviceOptions, Features, ModeFlags};
use embedded_can::StandardId;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> candle_driver::Result<()> {
    let manager = DeviceManager::rusb().with_options(DeviceOptions::default().with_receive_echo(true));
    let Some(descriptor) = manager.enumerate()?.next() else {
        println!("No gs_usb device found");
        return Ok(());
    };

    let device = manager.open(&descriptor)?;
    println!("Opened {}: {}", device, device.info());

    let channel = device.channel(0)?;
    channel.set_bitrate(500_000)?;

    let mut flags = ModeFlags::NORMAL;
    if channel.features().contains(Features::HW_TIMESTAMP) {
        flags |= ModeFlags::HW_TIMESTAMP;
    }
    channel.start(flags)?;

    let id = StandardId::new(0x321).unwrap_or(StandardId::ZERO);
    let start = Instant::now();
    let mut next_tx = start;
    let mut counter = 0u8;

    while start.elapsed() < Duration::from_secs(10) {
        if Instant::now() >= next_tx {
            if let Some(frame) = CanFrame::new(id, &[counter, 0xAA, 0x55]) {
                match channel.send(&frame) {
                    Ok(echo) => println!("TX  {} (echo {})", frame, echo),
                    Err(CandleError::QueueFull) => println!("TX queue full, skipping"),
                    Err(e) => return Err(e),
                }
            }
            counter = counter.wrapping_add(1);
            next_tx += Duration::from_secs(1);
        }

        if let Some(frame) = channel.receive(Some(Duration::from_millis(100)))? {
            let kind = if frame.is_echo() { "ECHO" } else { "RX  " };
            match frame.timestamp_us() {
                Some(ts) => println!("{} {} @ {} us", kind, frame, ts),
                None => println!("{} {}", kind, frame),
            }
        }
    }

    channel.stop()?;
    println!("{:?}", channel.stats());
    println!("{:?}", device.stats());
    Ok(())
}
