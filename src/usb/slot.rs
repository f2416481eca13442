//! The single drive slot shared by the hot-plug watcher and the player loops.
//!
//! At most one device is open at a time. Issuing commands requires holding the slot's
//! command lock, and every acquisition is bounded by a deadline so a stuck holder can
//! never starve the other loop for good.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::scsi::SCSIDevice;

struct Shared<B> {
    open: AtomicBool,
    device: Mutex<Option<SCSIDevice<B>>>,
}

pub struct DriveSlot<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for DriveSlot<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B> Default for DriveSlot<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> DriveSlot<B> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                open: AtomicBool::new(false),
                device: Mutex::new(None),
            }),
        }
    }

    /// Whether a device is attached. Lock free, meant for polling.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub async fn attach(&self, device: SCSIDevice<B>) {
        let mut slot = self.shared.device.lock().await;
        *slot = Some(device);
        self.shared.open.store(true, Ordering::Release);
        info!("drive attached");
    }

    /// Drops the open device. The flag is cleared before waiting for the lock so the
    /// loops stop issuing new commands right away.
    pub async fn detach(&self) {
        self.shared.open.store(false, Ordering::Release);
        let device = self.shared.device.lock().await.take();
        if device.is_some() {
            info!("drive detached");
        }
    }

    /// Takes the command lock, giving up after `wait`. `None` when the lock could not
    /// be had in time or no device is attached.
    pub async fn lock(&self, wait: Duration) -> Option<MappedMutexGuard<'_, SCSIDevice<B>>> {
        if !self.is_open() {
            return None;
        }
        let guard = match tokio::time::timeout(wait, self.shared.device.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                debug!(?wait, "command lock is busy");
                return None;
            }
        };
        MutexGuard::try_map(guard, |device| device.as_mut()).ok()
    }
}
