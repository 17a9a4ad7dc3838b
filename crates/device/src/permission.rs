use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use app_core::ids::DeviceId;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use transport_usb::{UsbBackend, UsbDeviceInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Granted,
    Denied,
    TimedOut,
}

struct PendingRequest {
    ticket: u64,
    device: DeviceId,
    reply: oneshot::Sender<bool>,
}

/// Bridges asynchronous OS permission answers to waiting callers.
///
/// Every request owns its reply channel. A request that times out (or whose
/// future is dropped) withdraws itself, so a late answer cannot reach a
/// different request.
pub struct PermissionGate {
    backend: Arc<dyn UsbBackend>,
    pending: Mutex<Vec<PendingRequest>>,
    next_ticket: AtomicU64,
}

/// Removes a pending request on every exit path of `request_access`.
struct Withdraw<'a> {
    pending: &'a Mutex<Vec<PendingRequest>>,
    ticket: u64,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        self.pending.lock().retain(|p| p.ticket != self.ticket);
    }
}

impl PermissionGate {
    pub fn new(backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            backend,
            pending: Mutex::new(vec![]),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub async fn request_access(&self, device: &UsbDeviceInfo, timeout: Duration) -> AccessOutcome {
        if self.backend.has_permission(device) {
            debug!(device = %device.name, "permission already held");
            return AccessOutcome::Granted;
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push(PendingRequest {
            ticket,
            device: device.name.clone(),
            reply: tx,
        });
        let _withdraw = Withdraw {
            pending: &self.pending,
            ticket,
        };

        if let Err(err) = self.backend.request_permission(device) {
            warn!(?err, device = %device.name, "permission request could not be issued");
            return AccessOutcome::Denied;
        }
        debug!(device = %device.name, ticket, "waiting for permission");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => AccessOutcome::Granted,
            Ok(Ok(false)) => AccessOutcome::Denied,
            Ok(Err(_)) => AccessOutcome::Denied,
            Err(_) => {
                warn!(device = %device.name, ?timeout, "permission request timed out");
                AccessOutcome::TimedOut
            }
        }
    }

    /// Deliver an OS answer to every request waiting on `device`.
    ///
    /// Returns how many waiters were woken.
    pub fn notify_result(&self, device: &DeviceId, granted: bool) -> usize {
        let waiters: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let (hit, keep) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|p| &p.device == device);
            *pending = keep;
            hit
        };

        if waiters.is_empty() {
            debug!(%device, granted, "permission result with no waiting request");
        }

        let mut woken = 0;
        for w in waiters {
            if w.reply.send(granted).is_ok() {
                woken += 1;
            }
        }
        woken
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
