//! Default [`EventServer`]: the warp callback server on a dedicated thread.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use callback_server::{CallbackServer, NotificationSink};
use crossbeam::channel;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{ControlPointError, Result};
use crate::transport::EventServer;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    port: u16,
    shutdown_tx: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// Hosts a [`CallbackServer`] inside its own single-threaded tokio runtime,
/// so the rest of the control point stays synchronous.
pub struct HttpEventServer {
    port_range: (u16, u16),
    running: Mutex<Option<Running>>,
}

impl HttpEventServer {
    pub fn new(port_range: (u16, u16)) -> Self {
        Self {
            port_range,
            running: Mutex::new(None),
        }
    }

    /// Port the server is bound to, once started
    pub fn port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|running| running.port)
    }
}

impl EventServer for HttpEventServer {
    fn start(&self, sink: NotificationSink) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let port_range = self.port_range;
        let (ready_tx, ready_rx) = channel::bounded::<std::result::Result<u16, String>>(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("upnp-callback".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Failed to build runtime: {}", e)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let server = match CallbackServer::new(port_range, sink).await {
                        Ok(server) => server,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(server.port()));

                    let _ = shutdown_rx.await;
                    if let Err(e) = server.shutdown().await {
                        tracing::warn!("Callback server shutdown failed: {}", e);
                    }
                });
            })
            .map_err(|e| ControlPointError::Transport(format!("Failed to spawn callback thread: {}", e)))?;

        let port = match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(ControlPointError::Transport(e));
            }
            Err(_) => {
                let _ = shutdown_tx.send(());
                return Err(ControlPointError::Transport(
                    "Callback server did not start in time".to_string(),
                ));
            }
        };

        tracing::debug!("Event server ready on port {}", port);
        *running = Some(Running {
            port,
            shutdown_tx,
            thread,
        });
        Ok(())
    }

    fn callback_url(&self, device_host: &str) -> Option<String> {
        let port = self.port()?;
        let local_ip = resolve(device_host)
            .and_then(CallbackServer::local_ip_for)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Some(CallbackServer::callback_url_for(local_ip, port))
    }

    fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.shutdown_tx.send(());
        if running.thread.join().is_err() {
            tracing::warn!("Callback server thread panicked");
        }
    }
}

impl Drop for HttpEventServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Address of a device host given as an IP literal or a resolvable name
fn resolve(host: &str) -> Option<IpAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip())
}
