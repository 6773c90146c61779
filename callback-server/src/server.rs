//! HTTP server for receiving UPnP event notifications.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;

use tokio::sync::oneshot;
use warp::http::StatusCode;
use warp::Filter;

use super::router::{EventRouter, NotificationPayload, NotificationSink};

/// HTTP callback server for receiving UPnP event notifications.
///
/// The `CallbackServer` binds to the first free port of a range and accepts
/// `NOTIFY` requests on any path. Each request is validated and handed to an
/// [`EventRouter`]; the response status tells the publisher whether the
/// subscription is known.
///
/// | Outcome | Status |
/// |---|---|
/// | routed | 200 |
/// | missing SID, bad SEQ, wrong NT/NTS | 400 |
/// | SID unknown to the sink | 412 |
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use callback_server::{CallbackServer, NotificationPayload};
///
/// #[tokio::main]
/// async fn main() {
///     let sink = Arc::new(|payload: NotificationPayload| {
///         println!("event {:?} for {}", payload.seq, payload.subscription_id);
///         true
///     });
///
///     let server = CallbackServer::new((3400, 3500), sink)
///         .await
///         .expect("Failed to create callback server");
///
///     println!("Server listening at: {}", server.base_url());
///     server.shutdown().await.unwrap();
/// }
/// ```
pub struct CallbackServer {
    /// The port the server is bound to
    port: u16,
    /// Callback URL using the default outbound address
    base_url: String,
    /// Event router for handling incoming events
    event_router: Arc<EventRouter>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server task handle
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind and start a callback server.
    ///
    /// Tries each port of `port_range` in order (a `(0, 0)` range lets the OS
    /// pick one) and starts serving on the first that binds.
    ///
    /// # Errors
    ///
    /// Returns an error message if no port in the range could be bound.
    pub async fn new(port_range: (u16, u16), sink: NotificationSink) -> Result<Self, String> {
        let event_router = Arc::new(EventRouter::new(sink));
        let routes = Self::routes(event_router.clone());

        for port in port_range.0..=port_range.1 {
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

            let bound = warp::serve(routes.clone()).try_bind_with_graceful_shutdown(addr, async move {
                let _ = shutdown_rx.await;
            });

            let (bound_addr, server) = match bound {
                Ok(bound) => bound,
                Err(e) => {
                    tracing::trace!("Port {} unavailable: {}", port, e);
                    continue;
                }
            };

            let port = bound_addr.port();
            let local_ip = Self::detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
            let base_url = Self::callback_url_for(local_ip, port);
            let server_handle = tokio::spawn(server);

            tracing::info!("Callback server listening on {}", bound_addr);

            return Ok(Self {
                port,
                base_url,
                event_router,
                shutdown_tx: Some(shutdown_tx),
                server_handle: Some(server_handle),
            });
        }

        Err(format!(
            "No available port found in range {}-{}",
            port_range.0, port_range.1
        ))
    }

    /// Callback URL using the address this host would use for outbound traffic.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the event router.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.event_router
    }

    /// Callback URL reachable from `device`.
    ///
    /// Picks the local address the routing table would use to reach the
    /// device, so multi-homed hosts hand out an address on the right network.
    pub fn callback_url_to(&self, device: IpAddr) -> String {
        let local_ip = Self::local_ip_for(device)
            .or_else(Self::detect_local_ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self::callback_url_for(local_ip, self.port)
    }

    /// Shutdown the callback server gracefully.
    ///
    /// Sends the shutdown signal and waits for in-flight requests to complete.
    pub async fn shutdown(mut self) -> Result<(), String> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| format!("Callback server task failed: {}", e))?;
        }

        tracing::info!("Callback server on port {} stopped", self.port);
        Ok(())
    }

    /// Check if a port is available for binding.
    pub fn is_port_available(port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).is_ok()
    }

    /// Local address used to reach `target`.
    ///
    /// Uses a connected UDP socket to consult the routing table. No data is
    /// actually sent.
    pub fn local_ip_for(target: IpAddr) -> Option<IpAddr> {
        let bind_addr: SocketAddr = match target {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).ok()?;
        socket.connect(SocketAddr::new(target, 1900)).ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip()).filter(|ip| !ip.is_unspecified())
    }

    /// Detect the default outbound address of this host.
    fn detect_local_ip() -> Option<IpAddr> {
        Self::local_ip_for(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
    }

    /// `http://ip:port/`, bracketing IPv6 addresses.
    pub fn callback_url_for(ip: IpAddr, port: u16) -> String {
        match ip {
            IpAddr::V4(v4) => format!("http://{v4}:{port}/"),
            IpAddr::V6(v6) => format!("http://[{v6}]:{port}/"),
        }
    }

    /// The NOTIFY endpoint, accepting any path.
    fn routes(
        event_router: Arc<EventRouter>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = std::convert::Infallible> + Clone {
        warp::method()
            .and(warp::path::full())
            .and(warp::header::optional::<String>("sid"))
            .and(warp::header::optional::<String>("seq"))
            .and(warp::header::optional::<String>("nt"))
            .and(warp::header::optional::<String>("nts"))
            .and(warp::body::bytes())
            .and_then(
                move |method: warp::http::Method,
                      path: warp::path::FullPath,
                      sid: Option<String>,
                      seq: Option<String>,
                      nt: Option<String>,
                      nts: Option<String>,
                      body: bytes::Bytes| {
                    let router = event_router.clone();
                    async move {
                        if method.as_str() != "NOTIFY" {
                            return Err(warp::reject::not_found());
                        }

                        tracing::trace!(
                            "NOTIFY {} sid={:?} seq={:?} ({} bytes)",
                            path.as_str(),
                            sid,
                            seq,
                            body.len()
                        );

                        if !Self::validate_upnp_headers(&sid, &nt, &nts) {
                            return Err(warp::reject::custom(InvalidUpnpHeaders));
                        }
                        let subscription_id = sid
                            .map(|sid| sid.trim().to_string())
                            .ok_or_else(|| warp::reject::custom(InvalidUpnpHeaders))?;
                        let seq = Self::parse_seq(seq.as_deref())
                            .map_err(|_| warp::reject::custom(InvalidUpnpHeaders))?;

                        let payload = NotificationPayload {
                            subscription_id,
                            seq,
                            event_xml: String::from_utf8_lossy(&body).into_owned(),
                        };

                        if router.route_event(payload) {
                            Ok(warp::reply::with_status("", StatusCode::OK))
                        } else {
                            Err(warp::reject::custom(UnknownSubscription))
                        }
                    }
                },
            )
            .recover(handle_rejection)
    }

    /// Validate UPnP event notification headers.
    ///
    /// The SID header is required. NT and NTS are optional, but when both
    /// are present they must carry the event values.
    fn validate_upnp_headers(
        sid: &Option<String>,
        nt: &Option<String>,
        nts: &Option<String>,
    ) -> bool {
        match sid {
            Some(sid) if !sid.trim().is_empty() => {}
            _ => return false,
        }

        if let (Some(nt_val), Some(nts_val)) = (nt, nts) {
            if nt_val.trim() != "upnp:event" || nts_val.trim() != "upnp:propchange" {
                return false;
            }
        }

        true
    }

    fn parse_seq(seq: Option<&str>) -> Result<Option<u32>, std::num::ParseIntError> {
        seq.map(|value| value.trim().parse::<u32>()).transpose()
    }
}

/// Custom rejection for invalid UPnP headers.
#[derive(Debug)]
struct InvalidUpnpHeaders;

impl warp::reject::Reject for InvalidUpnpHeaders {}

/// Custom rejection for a SID no subscription owns.
#[derive(Debug)]
struct UnknownSubscription;

impl warp::reject::Reject for UnknownSubscription {}

/// Handle rejections and convert them to HTTP responses.
async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let (code, message) = if err.find::<UnknownSubscription>().is_some() {
        (StatusCode::PRECONDITION_FAILED, "Subscription not found")
    } else if err.find::<InvalidUpnpHeaders>().is_some()
        || err.find::<warp::reject::InvalidHeader>().is_some()
    {
        (StatusCode::BAD_REQUEST, "Invalid UPnP headers")
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    };

    Ok(warp::reply::with_status(message, code))
}
