//! Device Listing Example
//!
//! Enumerates gs_usb adapters and reports whether each is in use. Then opens
//! each one and prints firmware and hardware versions, channel count, clock
//! and per-channel features and timing limits.

use candle_driver::{DeviceManager, TimingLimits};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_limits(label: &str, limits: &TimingLimits) {
    println!(
        "    {}: TSEG1 {}-{}, TSEG2 {}-{}, SJW <= {}, BRP {}-{} (step {})",
        label,
        limits.tseg1_min,
        limits.tseg1_max,
        limits.tseg2_min,
        limits.tseg2_max,
        limits.sjw_max,
        limits.brp_min,
        limits.brp_max,
        limits.brp_inc
    );
}

fn run() -> candle_driver::Result<()> {
    let manager = DeviceManager::rusb();
    let devices: Vec<_> = manager.enumerate()?.collect();
    if devices.is_empty() {
        println!("No gs_usb device found");
        return Ok(());
    }

    for descriptor in &devices {
        println!("{}", descriptor);
        if let Some(product) = &descriptor.product {
            println!("  Product: {}", product);
        }
        match manager.availability(descriptor) {
            Ok(state) => println!("  State: {}", state),
            Err(e) => println!("  State unknown: {}", e),
        }

        let device = match manager.open(descriptor) {
            Ok(device) => device,
            Err(e) => {
                println!("  Could not open: {}", e);
                continue;
            }
        };

        let info = device.info();
        println!("  {}", info);
        for channel in device.channels() {
            let caps = channel.capabilities();
            println!(
                "  Channel {}: {:.1} MHz, features: {}",
                channel.index(),
                caps.clock_mhz(),
                caps.features.names().join(" ")
            );
            print_limits("nominal", &caps.nominal);
            if let Some(data) = &caps.data {
                print_limits("data", data);
            }
        }
        println!();
    }

    Ok(())
}
