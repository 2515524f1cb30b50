//! libusb backend built on `rusb`
//!
//! libusb's bulk calls are synchronous, so each open handle runs two worker
//! threads: one reading the bulk IN endpoint and one writing bulk OUT
//! transfers. Submitted transfers are queued to the matching worker and
//! completed from that worker's thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use rusb::{Device, DeviceHandle, GlobalContext};

use super::{
    Completion, CompletionSink, ControlSetup, DeviceAvailability, DeviceDescriptor, Transfer,
    TransferKind, UsbHandle, UsbTransport,
};
use crate::constants::GS_USB_KNOWN_IDS;
use crate::error::TransportError;

/// How often a blocked bulk read checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Devices reached through the libusb global context
#[derive(Debug, Clone)]
pub struct RusbTransport {
    describe_ids: Vec<(u16, u16)>,
}

impl RusbTransport {
    /// Transport reading string descriptors of the known gs_usb devices
    pub fn new() -> Self {
        Self::with_ids(&GS_USB_KNOWN_IDS)
    }

    /// Transport reading string descriptors of devices in `ids`
    ///
    /// Reading strings requires opening the device, so other devices are
    /// listed with only their numeric identifiers.
    pub fn with_ids(ids: &[(u16, u16)]) -> Self {
        Self {
            describe_ids: ids.to_vec(),
        }
    }

    fn find(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Option<Device<GlobalContext>>, TransportError> {
        for device in rusb::devices()?.iter() {
            if device.bus_number() != descriptor.bus || device.address() != descriptor.address {
                continue;
            }

            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };

            if desc.vendor_id() == descriptor.vendor_id
                && desc.product_id() == descriptor.product_id
            {
                return Ok(Some(device));
            }
        }
        Ok(None)
    }
}

impl Default for RusbTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for RusbTransport {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let mut devices = Vec::new();

        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };

            let mut entry = DeviceDescriptor {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                bus: device.bus_number(),
                address: device.address(),
                port_numbers: device.port_numbers().unwrap_or_default(),
                ..Default::default()
            };

            if entry.matches(&self.describe_ids) {
                if let Ok(handle) = device.open() {
                    entry.manufacturer = handle.read_manufacturer_string_ascii(&desc).ok();
                    entry.product = handle.read_product_string_ascii(&desc).ok();
                    entry.serial = handle.read_serial_number_string_ascii(&desc).ok();
                }
            }

            devices.push(entry);
        }

        Ok(devices)
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        interface: u8,
    ) -> Result<Box<dyn UsbHandle>, TransportError> {
        let device = self.find(descriptor)?.ok_or(TransportError::NotFound)?;
        let mut handle = device.open()?;

        if let Ok(true) = handle.kernel_driver_active(interface) {
            debug!("Detaching kernel driver from interface {}", interface);
            handle.detach_kernel_driver(interface)?;
        }
        handle.claim_interface(interface)?;

        Ok(Box::new(RusbHandle::start(handle, interface)?))
    }

    fn availability(
        &self,
        descriptor: &DeviceDescriptor,
        interface: u8,
    ) -> Result<DeviceAvailability, TransportError> {
        let device = self.find(descriptor)?.ok_or(TransportError::NotFound)?;
        let mut handle = match device.open() {
            Ok(handle) => handle,
            Err(rusb::Error::Busy) => return Ok(DeviceAvailability::InUse),
            Err(e) => return Err(e.into()),
        };

        // A bound kernel driver is detached by `open`
        if let Ok(true) = handle.kernel_driver_active(interface) {
            return Ok(DeviceAvailability::Available);
        }
        match handle.claim_interface(interface) {
            Ok(()) => {
                if let Err(e) = handle.release_interface(interface) {
                    trace!("Releasing interface {} after check: {}", interface, e);
                }
                Ok(DeviceAvailability::Available)
            }
            Err(rusb::Error::Busy) => Ok(DeviceAvailability::InUse),
            Err(e) => Err(e.into()),
        }
    }
}

struct Job {
    transfer: Transfer,
    sink: Arc<dyn CompletionSink>,
    generation: u64,
}

struct HandleShared {
    handle: DeviceHandle<GlobalContext>,
    /// Bumped by `cancel_all`; jobs from older generations are cancelled
    generation: AtomicU64,
    shutdown: AtomicBool,
}

impl HandleShared {
    fn is_cancelled(&self, generation: u64) -> bool {
        self.shutdown.load(Ordering::Acquire) || self.generation.load(Ordering::Acquire) != generation
    }
}

fn complete(job: Job, result: Result<usize, TransportError>) {
    let Job { transfer, sink, .. } = job;
    let (actual_len, status) = match result {
        Ok(len) => (len, Ok(())),
        Err(e) => (0, Err(e)),
    };
    sink.on_complete(Completion {
        transfer,
        actual_len,
        status,
    });
}

fn run_receive(shared: Arc<HandleShared>, jobs: Receiver<Job>) {
    while let Ok(mut job) = jobs.recv() {
        let result = loop {
            if shared.is_cancelled(job.generation) {
                break Err(TransportError::Cancelled);
            }
            let endpoint = job.transfer.endpoint;
            match shared
                .handle
                .read_bulk(endpoint, &mut job.transfer.buffer, POLL_INTERVAL)
            {
                Ok(len) => break Ok(len),
                Err(rusb::Error::Timeout) => continue,
                Err(e) => break Err(TransportError::from(e)),
            }
        };
        if let Err(e) = &result {
            if *e != TransportError::Cancelled {
                warn!("Bulk IN transfer failed: {}", e);
            }
        }
        complete(job, result);
    }
    trace!("Bulk IN worker exiting");
}

fn run_transmit(shared: Arc<HandleShared>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        let result = if shared.is_cancelled(job.generation) {
            Err(TransportError::Cancelled)
        } else {
            let transfer = &job.transfer;
            shared
                .handle
                .write_bulk(transfer.endpoint, &transfer.buffer, transfer.timeout)
                .map_err(TransportError::from)
        };
        complete(job, result);
    }
    trace!("Bulk OUT worker exiting");
}

/// An open libusb device with its interface claimed
pub struct RusbHandle {
    shared: Arc<HandleShared>,
    interface: u8,
    receive_jobs: Mutex<Option<Sender<Job>>>,
    transmit_jobs: Mutex<Option<Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl RusbHandle {
    fn start(handle: DeviceHandle<GlobalContext>, interface: u8) -> Result<Self, TransportError> {
        let shared = Arc::new(HandleShared {
            handle,
            generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let (receive_tx, receive_rx) = mpsc::channel();
        let (transmit_tx, transmit_rx) = mpsc::channel();

        let rx_shared = Arc::clone(&shared);
        let receiver = thread::Builder::new()
            .name("gs_usb-bulk-in".into())
            .spawn(move || run_receive(rx_shared, receive_rx))
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let tx_shared = Arc::clone(&shared);
        let transmitter = thread::Builder::new()
            .name("gs_usb-bulk-out".into())
            .spawn(move || run_transmit(tx_shared, transmit_rx))
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self {
            shared,
            interface,
            receive_jobs: Mutex::new(Some(receive_tx)),
            transmit_jobs: Mutex::new(Some(transmit_tx)),
            workers: vec![receiver, transmitter],
        })
    }
}

impl UsbHandle for RusbHandle {
    fn control_in(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(self.shared.handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            timeout,
        )?)
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(self.shared.handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            timeout,
        )?)
    }

    fn submit(
        &self,
        transfer: Transfer,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(), TransportError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled);
        }

        let queue = match transfer.kind {
            TransferKind::Receive => &self.receive_jobs,
            TransferKind::Transmit { .. } => &self.transmit_jobs,
        };
        let job = Job {
            transfer,
            sink,
            generation: self.shared.generation.load(Ordering::Acquire),
        };

        let guard = queue.lock();
        match guard.as_ref() {
            Some(sender) => sender.send(job).map_err(|_| TransportError::Disconnected),
            None => Err(TransportError::Cancelled),
        }
    }

    fn cancel_all(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for RusbHandle {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);

        // Closing the queues lets the workers finish what is queued and exit
        self.receive_jobs.lock().take();
        self.transmit_jobs.lock().take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("USB worker thread panicked");
            }
        }

        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            match shared.handle.release_interface(self.interface) {
                Ok(()) => debug!("Released interface {}", self.interface),
                Err(rusb::Error::NoDevice) => {}
                Err(e) => warn!("Failed to release interface {}: {}", self.interface, e),
            }
        }
    }
}
