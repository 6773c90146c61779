//! Generic UPnP callback server for receiving event notifications.
//!
//! This crate provides a lightweight HTTP server for handling GENA `NOTIFY`
//! requests. It has no knowledge of devices or services: it validates the
//! request, extracts the subscription ID, event key and body, and asks a sink
//! whether the subscription is known.
//!
//! # Overview
//!
//! - [`CallbackServer`]: HTTP server bound to the first free port of a range
//! - [`EventRouter`]: hands validated notifications to a [`NotificationSink`]
//! - [`NotificationPayload`]: subscription ID, `SEQ` and raw XML of one event
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashSet;
//! use std::sync::{Arc, Mutex};
//! use callback_server::{CallbackServer, NotificationPayload};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let known = Arc::new(Mutex::new(HashSet::from(["uuid:subscription-123".to_string()])));
//!     let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
//!
//!     let sink_known = Arc::clone(&known);
//!     let server = CallbackServer::new((3400, 3500), Arc::new(move |payload: NotificationPayload| {
//!         let known = sink_known.lock().map(|k| k.contains(&payload.subscription_id)).unwrap_or(false);
//!         known && tx.send(payload).is_ok()
//!     }))
//!     .await?;
//!
//!     println!("Callback server listening at: {}", server.base_url());
//!
//!     while let Some(notification) = rx.recv().await {
//!         println!("Event {:?} for {}", notification.seq, notification.subscription_id);
//!     }
//!
//!     server.shutdown().await
//! }
//! ```

pub mod router;
mod server;

pub use router::{EventRouter, NotificationPayload, NotificationSink};
pub use server::CallbackServer;
