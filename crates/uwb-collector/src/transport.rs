// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transport abstraction
//!
//! Keeps the subscriber independent of the MQTT client library. A transport
//! opens the session, then drives it and reports what happens through
//! [`BrokerEvents`].
//!
//! # Integration
//!
//! ```ignore
//! impl BrokerTransport for MyClient {
//!     async fn connect(&mut self, filter: &str, events: Arc<dyn BrokerEvents>)
//!         -> Result<Arc<dyn SessionControl>, ConnectionError> { /* ... */ }
//!     async fn run(&mut self, cancel: CancellationToken) -> SessionEnd { /* ... */ }
//! }
//! ```

use crate::error::ConnectionError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// Broker events, invoked by the transport.
pub trait BrokerEvents: Send + Sync {
    /// Session is up and the subscription to `filter` was accepted.
    fn on_connected(&self, filter: &str);

    /// A message arrived on `topic` (the exact topic, not the filter).
    fn on_message(&self, topic: &str, payload: &[u8]);

    /// The session is gone, whoever closed it.
    fn on_disconnected(&self);
}

/// Lets another task close an established session.
pub trait SessionControl: Send + Sync {
    /// Ask the transport to send a disconnect. Never blocks.
    fn request_disconnect(&self);
}

/// How [`BrokerTransport::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The cancellation token fired.
    Cancelled,
    /// The link closed, on request or from the broker side.
    Closed,
}

/// A broker client the subscriber can drive.
pub trait BrokerTransport: Send + 'static {
    /// Open the session, authenticate and subscribe to `filter`.
    ///
    /// Events are delivered to `events` from here on, including messages
    /// that arrive before `connect` returns.
    fn connect(
        &mut self,
        filter: &str,
        events: Arc<dyn BrokerEvents>,
    ) -> impl Future<Output = Result<Arc<dyn SessionControl>, ConnectionError>> + Send;

    /// Receive until the link closes or `cancel` fires. A cancelled session
    /// must still be closed cleanly before this returns.
    fn run(&mut self, cancel: CancellationToken) -> impl Future<Output = SessionEnd> + Send;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

enum MockEvent {
    Publish {
        topic: String,
        payload: Vec<u8>,
        delivered: oneshot::Sender<()>,
    },
    Drop,
}

#[derive(Default)]
struct MockShared {
    connects: AtomicUsize,
    disconnect_requests: AtomicUsize,
    disconnect: Notify,
    connect_error: Mutex<Option<ConnectionError>>,
    filter: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scripted transport for tests. Driven through its [`MockBroker`] handle.
pub struct MockTransport {
    shared: Arc<MockShared>,
    inbound: mpsc::UnboundedReceiver<MockEvent>,
    events: Option<Arc<dyn BrokerEvents>>,
}

/// Test-side handle: publish messages, drop the link, inspect calls.
///
/// Dropping every handle closes the mock link like a broker disconnect.
#[derive(Clone)]
pub struct MockBroker {
    shared: Arc<MockShared>,
    tx: mpsc::UnboundedSender<MockEvent>,
}

impl MockTransport {
    /// Create a transport that connects successfully.
    pub fn new() -> (Self, MockBroker) {
        let shared = Arc::new(MockShared::default());
        let (tx, inbound) = mpsc::unbounded_channel();
        let transport = Self {
            shared: Arc::clone(&shared),
            inbound,
            events: None,
        };
        (transport, MockBroker { shared, tx })
    }

    /// Create a transport whose `connect` fails with `err`.
    pub fn refusing(err: ConnectionError) -> (Self, MockBroker) {
        let (transport, broker) = Self::new();
        *lock(&transport.shared.connect_error) = Some(err);
        (transport, broker)
    }
}

impl MockBroker {
    /// Queue a message and wait until the subscriber has handled it.
    ///
    /// Returns `false` if the session ended before delivery.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let (delivered, ack) = oneshot::channel();
        let event = MockEvent::Publish {
            topic: topic.to_string(),
            payload: payload.into(),
            delivered,
        };
        if self.tx.send(event).is_err() {
            return false;
        }
        ack.await.is_ok()
    }

    /// Close the link from the broker side.
    pub fn drop_connection(&self) {
        let _ = self.tx.send(MockEvent::Drop);
    }

    /// Number of `connect` calls.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of disconnect requests received through [`SessionControl`].
    pub fn disconnect_requests(&self) -> usize {
        self.shared.disconnect_requests.load(Ordering::SeqCst)
    }

    /// Filter passed to the last successful `connect`.
    pub fn subscribed_filter(&self) -> Option<String> {
        lock(&self.shared.filter).clone()
    }
}

struct MockSession {
    shared: Arc<MockShared>,
}

impl SessionControl for MockSession {
    fn request_disconnect(&self) {
        self.shared.disconnect_requests.fetch_add(1, Ordering::SeqCst);
        self.shared.disconnect.notify_one();
    }
}

impl BrokerTransport for MockTransport {
    async fn connect(
        &mut self,
        filter: &str,
        events: Arc<dyn BrokerEvents>,
    ) -> Result<Arc<dyn SessionControl>, ConnectionError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let refused = lock(&self.shared.connect_error).take();
        if let Some(err) = refused {
            return Err(err);
        }

        *lock(&self.shared.filter) = Some(filter.to_string());
        events.on_connected(filter);
        self.events = Some(events);

        Ok(Arc::new(MockSession {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn run(&mut self, cancel: CancellationToken) -> SessionEnd {
        let Some(events) = self.events.clone() else {
            return SessionEnd::Closed;
        };
        let shared = Arc::clone(&self.shared);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = shared.disconnect.notified() => {
                    events.on_disconnected();
                    return SessionEnd::Closed;
                }
                event = self.inbound.recv() => match event {
                    Some(MockEvent::Publish { topic, payload, delivered }) => {
                        events.on_message(&topic, &payload);
                        let _ = delivered.send(());
                    }
                    Some(MockEvent::Drop) | None => {
                        events.on_disconnected();
                        return SessionEnd::Closed;
                    }
                },
            }
        }
    }
}
