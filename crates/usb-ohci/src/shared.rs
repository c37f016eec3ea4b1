//! Thread-safe controller handle and the background frame timer.
//!
//! The frame timer and the device stack's completion path run on different threads. Both go
//! through [`SharedOhci`], which serializes them on one mutex, so a frame pass never overlaps
//! another pass or a completion-mode list walk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::debug;

use crate::device::{AttachObserver, DeviceId, PortOwner, UsbPacket, UsbSpeed};
use crate::ohci::OhciController;

#[derive(Clone)]
pub struct SharedOhci {
    inner: Arc<Mutex<OhciController>>,
}

impl SharedOhci {
    pub fn new(ctrl: OhciController) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ctrl)),
        }
    }

    /// Locks the controller. A panic on another thread does not wedge the controller.
    pub fn lock(&self) -> MutexGuard<'_, OhciController> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mmio_read(&self, offset: u64, size: usize) -> u32 {
        self.lock().mmio_read(offset, size)
    }

    pub fn mmio_write(&self, offset: u64, size: usize, value: u32) {
        self.lock().mmio_write(offset, size, value);
    }

    pub fn irq_level(&self) -> bool {
        self.lock().irq_level()
    }

    /// Runs all due frame passes.
    pub fn poll(&self) -> usize {
        self.lock().poll()
    }
}

impl AttachObserver for SharedOhci {
    fn attach(&self, port: usize, speed: UsbSpeed) {
        self.lock().attach(port, speed);
    }

    fn detach(&self, port: usize, device: Option<DeviceId>) {
        self.lock().detach(port, device);
    }

    fn child_detach(&self, device: DeviceId) {
        self.lock().child_detach(device);
    }
}

impl PortOwner for SharedOhci {
    fn wakeup(&self, port: usize) {
        self.lock().wakeup(port);
    }

    fn async_complete(&self, packet: UsbPacket) {
        self.lock().async_complete(packet);
    }
}

/// Background thread polling the controller's frame timer.
pub struct FrameWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameWorker {
    pub fn spawn(ohci: SharedOhci) -> std::io::Result<Self> {
        let interval = ohci.lock().config().worker_poll_interval;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("ohci-frame".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    ohci.poll();
                    std::thread::sleep(interval);
                }
                debug!("OHCI frame worker stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the worker and waits for it to exit. Stopping twice is a no-op.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("OHCI frame worker panicked");
            }
        }
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
