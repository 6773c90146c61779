//! Plumbing shared by the background scheduler loops.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

/// Coalescing wake signal.
///
/// Any number of `notify` calls between two waits collapse into a single
/// pending wake-up.
#[derive(Clone)]
pub(crate) struct Wakeup {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Wakeup {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self { tx, rx }
    }

    pub(crate) fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    pub(crate) fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

/// A named loop thread stopped by disconnecting its shutdown channel.
pub(crate) struct LoopHandle {
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// Spawn `body` on a new thread; `body` must return once its shutdown
    /// receiver reports disconnection.
    pub(crate) fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(shutdown_rx))?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Interrupt the loop and wait for it, unless called from the loop itself
    pub(crate) fn stop(mut self) {
        drop(self.shutdown_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
