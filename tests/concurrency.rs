use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use candle_driver::transport::mock::{MockControl, MockDevice, MockTransport};
use candle_driver::{CanFrame, CandleError, Device, DeviceManager, DeviceOptions, HostFrame, ModeFlags};
use embedded_can::StandardId;

fn open(options: DeviceOptions) -> (Device, MockControl) {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = Arc::new(MockTransport::new());
    let mock = transport.add(MockDevice::new());
    let manager = DeviceManager::new(transport).with_options(options);
    let descriptor = manager.enumerate().unwrap().next().unwrap();
    (manager.open(&descriptor).unwrap(), mock)
}

fn frame(id: u16) -> CanFrame {
    CanFrame::new(StandardId::new(id).unwrap(), &id.to_le_bytes()).unwrap()
}

#[test]
fn test_concurrent_senders_respect_capacity() {
    let (device, mock) = open(DeviceOptions::default().with_tx_capacity(4));
    let channel = device.channel(0).unwrap();
    channel.start(ModeFlags::NORMAL).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let completer = {
        let mock = mock.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                mock.complete_tx(1);
                thread::yield_now();
            }
        })
    };

    let sent = Arc::new(AtomicUsize::new(0));
    let senders: Vec<_> = (0..8)
        .map(|t| {
            let channel = channel.clone();
            let sent = Arc::clone(&sent);
            thread::spawn(move || {
                let mut ok = 0;
                while ok < 25 {
                    match channel.send(&frame(t * 100 + ok)) {
                        Ok(_) => ok += 1,
                        Err(CandleError::QueueFull) => thread::yield_now(),
                        Err(e) => panic!("send failed: {}", e),
                    }
                }
                sent.fetch_add(ok as usize, Ordering::Relaxed);
            })
        })
        .collect();

    for sender in senders {
        sender.join().unwrap();
    }
    done.store(true, Ordering::Release);
    completer.join().unwrap();
    mock.complete_tx(usize::MAX);

    assert_eq!(sent.load(Ordering::Relaxed), 200);
    assert!(mock.max_pending_tx() <= 4);
    assert_eq!(channel.tx_in_flight(), 0);
    assert_eq!(channel.stats().tx_frames, 200);
    channel.stop().unwrap();
}

#[test]
fn test_echo_ids_are_unique() {
    let (device, mock) = open(DeviceOptions::default().with_tx_capacity(64));
    let channel = device.channel(0).unwrap();
    channel.start(ModeFlags::NORMAL).unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let channel = channel.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..16)
                    .map(|i| channel.send(&frame(t * 16 + i)).unwrap())
                    .collect::<Vec<u32>>()
            })
        })
        .collect();

    let mut ids: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 64);
    assert_eq!(mock.pending_tx(), 64);

    // Stopping cancels outstanding transmits and frees their slots
    channel.stop().unwrap();
    assert_eq!(mock.pending_tx(), 0);
    assert_eq!(channel.tx_in_flight(), 0);
    assert_eq!(channel.stats().tx_errors, 64);
}

#[test]
fn test_stop_racing_senders_leaves_nothing_in_flight() {
    let (device, mock) = open(
        DeviceOptions::default()
            .with_tx_capacity(64)
            .with_drain_timeout(Duration::from_secs(5)),
    );
    let channel = device.channel(0).unwrap();

    for round in 0..20u16 {
        channel.start(ModeFlags::NORMAL).unwrap();
        let barrier = Arc::new(Barrier::new(5));
        let senders: Vec<_> = (0..4u16)
            .map(|t| {
                let channel = channel.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut i = 0u16;
                    loop {
                        match channel.send(&frame((round * 4 + t) % 0x700 + i % 8)) {
                            Ok(_) | Err(CandleError::QueueFull) => i = i.wrapping_add(1),
                            Err(CandleError::InvalidState { .. }) => return,
                            Err(e) => panic!("send failed: {}", e),
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(1));
        let started = Instant::now();
        channel.stop().unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "stop took {:?}",
            started.elapsed()
        );

        for sender in senders {
            sender.join().unwrap();
        }
        assert_eq!(channel.tx_in_flight(), 0);
        assert_eq!(mock.pending_tx(), 0);
    }
}

#[test]
fn test_stop_wakes_blocked_receiver() {
    let (device, _mock) = open(DeviceOptions::default());
    let channel = device.channel(0).unwrap();
    channel.start(ModeFlags::NORMAL).unwrap();

    let receiver = {
        let channel = channel.clone();
        thread::spawn(move || channel.receive(None))
    };

    thread::sleep(Duration::from_millis(50));
    channel.stop().unwrap();
    assert_eq!(receiver.join().unwrap(), Ok(None));
}

#[test]
fn test_receiver_gets_frames_from_delivery_thread() {
    let (device, mock) = open(DeviceOptions::default().with_rx_fifo_capacity(256));
    let channel = device.channel(0).unwrap();
    channel.start(ModeFlags::NORMAL).unwrap();

    let producer = thread::spawn(move || {
        for id in 0..100u16 {
            while !mock.deliver_frame(&HostFrame::new(0, frame(id))) {
                thread::yield_now();
            }
        }
    });

    let mut received = Vec::new();
    while received.len() < 100 {
        match channel.receive(Some(Duration::from_secs(5))).unwrap() {
            Some(frame) => received.push(frame.raw_id()),
            None => panic!("timed out after {} frames", received.len()),
        }
    }
    producer.join().unwrap();

    let expected: Vec<u32> = (0..100).collect();
    assert_eq!(received, expected);
    channel.stop().unwrap();
}

#[test]
fn test_disconnect_fails_blocked_receiver() {
    let (device, mock) = open(DeviceOptions::default());
    let channel = device.channel(0).unwrap();
    channel.start(ModeFlags::NORMAL).unwrap();

    let receiver = {
        let channel = channel.clone();
        thread::spawn(move || channel.receive(None))
    };

    thread::sleep(Duration::from_millis(50));
    mock.unplug();
    assert_eq!(receiver.join().unwrap(), Err(CandleError::DeviceGone));
    assert!(device.close().is_ok());
}
