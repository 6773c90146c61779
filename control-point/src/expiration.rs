//! Expiration scheduler
//!
//! One background thread evicting discovered devices whose liveness deadline
//! has passed. It sleeps until the earliest deadline plus a margin, or
//! indefinitely when nothing can expire, and is woken early whenever the
//! registry reports a deadline change.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver};
use crossbeam::select;
use parking_lot::Mutex;

use crate::registry::DeviceRegistry;
use crate::schedule::{LoopHandle, Wakeup};

/// Background eviction of expired devices
pub struct ExpirationScheduler {
    registry: Arc<DeviceRegistry>,
    margin: Duration,
    wakeup: Wakeup,
    handle: Mutex<Option<LoopHandle>>,
}

impl ExpirationScheduler {
    pub(crate) fn new(registry: Arc<DeviceRegistry>, margin: Duration, wakeup: Wakeup) -> Self {
        Self {
            registry,
            margin,
            wakeup,
            handle: Mutex::new(None),
        }
    }

    /// Recompute the wait; called when a device deadline changes
    pub fn wake(&self) {
        self.wakeup.notify();
    }

    /// Start the loop thread; a no-op when already running
    pub fn start(&self) -> std::io::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        let margin = self.margin;
        let wake_rx = self.wakeup.receiver();
        *handle = Some(LoopHandle::spawn("upnp-expiration", move |shutdown_rx| {
            run(&registry, margin, &wake_rx, &shutdown_rx)
        })?);
        tracing::debug!("Expiration scheduler started");
        Ok(())
    }

    /// Interrupt and join the loop thread
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.stop();
            tracing::debug!("Expiration scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}

fn run(
    registry: &DeviceRegistry,
    margin: Duration,
    wake_rx: &Receiver<()>,
    shutdown_rx: &Receiver<()>,
) {
    loop {
        let timer = match registry.next_deadline().and_then(|d| d.checked_add(margin)) {
            Some(at) => channel::at(at),
            None => channel::never(),
        };

        select! {
            recv(shutdown_rx) -> _ => break,
            recv(wake_rx) -> _ => {},
            recv(timer) -> _ => {
                let evicted = registry.evict_expired(Instant::now());
                if evicted > 0 {
                    tracing::debug!("Evicted {} expired device(s)", evicted);
                }
            },
        }
    }
}
