// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker subscriber
//!
//! Turns broker events into samples in the topic buffer.
//!
//! # Operation
//!
//! 1. `connect` opens the session and subscribes to `<prefix>/#`
//! 2. `run` receives until the run flag drops, the link closes or the
//!    network unit is cancelled
//! 3. each message is decoded and appended under its exact topic
//! 4. an unsolicited disconnect is reported to the controller as a stop
//!    request

use crate::codec::decode_reading;
use crate::error::ConnectionError;
use crate::lifecycle::{RunFlag, StopHandle, StopTrigger};
use crate::sample::{Sample, TopicWriter};
use crate::transport::{BrokerEvents, BrokerTransport, SessionControl, SessionEnd};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often `run` re-checks the run flag.
const RUN_FLAG_POLL: Duration = Duration::from_millis(250);

/// Broker connection state, owned by the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// Disconnect requested by us, waiting for the link to close.
    Stopping = 3,
    Stopped = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Disconnected,
        }
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Apply `f` atomically. Returns the previous state when `f` produced a
    /// new one.
    fn update(
        &self,
        f: impl Fn(ConnectionState) -> Option<ConnectionState>,
    ) -> Result<ConnectionState, ConnectionState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                f(ConnectionState::from_u8(raw)).map(|next| next as u8)
            })
            .map(ConnectionState::from_u8)
            .map_err(ConnectionState::from_u8)
    }
}

/// Subscriber statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Messages delivered by the broker
    pub messages_received: u64,
    /// Samples appended to the buffer
    pub samples_recorded: u64,
    /// Messages dropped because the payload could not be decoded
    pub decode_errors: u64,
    /// Messages dropped because collection had stopped
    pub ignored_after_stop: u64,
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    samples_recorded: AtomicU64,
    decode_errors: AtomicU64,
    ignored_after_stop: AtomicU64,
}

/// Broker subscriber
///
/// Shared between the network unit (through [`BrokerEvents`]) and the
/// controller (through [`disconnect`](Self::disconnect)).
pub struct Subscriber {
    filter: String,
    value_field: String,
    writer: TopicWriter,
    run_flag: RunFlag,
    stop: StopHandle,
    state: StateCell,
    session: Mutex<Option<Arc<dyn SessionControl>>>,
    counters: Counters,
}

impl Subscriber {
    /// Create a subscriber for `filter` that appends into `writer`.
    pub fn new(
        filter: impl Into<String>,
        value_field: impl Into<String>,
        writer: TopicWriter,
        run_flag: RunFlag,
        stop: StopHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            filter: filter.into(),
            value_field: value_field.into(),
            writer,
            run_flag,
            stop,
            state: StateCell::new(ConnectionState::Disconnected),
            session: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Subscription filter.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Get subscriber statistics
    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            samples_recorded: self.counters.samples_recorded.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            ignored_after_stop: self.counters.ignored_after_stop.load(Ordering::Relaxed),
        }
    }

    /// Open the session and subscribe. Failures are returned, not retried.
    pub async fn connect<T: BrokerTransport>(
        self: &Arc<Self>,
        transport: &mut T,
    ) -> Result<(), ConnectionError> {
        self.state.store(ConnectionState::Connecting);
        let events: Arc<dyn BrokerEvents> = self.clone();

        match transport.connect(&self.filter, events).await {
            Ok(session) => {
                // Store and check under the lock disconnect() claims with,
                // so exactly one side sends the request.
                let stopping = {
                    let mut slot = lock(&self.session);
                    *slot = Some(Arc::clone(&session));
                    self.state.load() == ConnectionState::Stopping
                };
                // disconnect() raced the handshake and found no session yet
                if stopping {
                    session.request_disconnect();
                }
                Ok(())
            }
            Err(e) => {
                self.state.store(ConnectionState::Disconnected);
                tracing::error!("Connection to broker failed: {}", e);
                Err(e)
            }
        }
    }

    /// Receive until the run flag drops, the link closes or `cancel` fires.
    pub async fn run<T: BrokerTransport>(
        self: &Arc<Self>,
        transport: &mut T,
        cancel: CancellationToken,
    ) -> SessionEnd {
        let session_cancel = cancel.child_token();
        let session = transport.run(session_cancel.clone());
        tokio::pin!(session);

        let mut flag_poll = tokio::time::interval(RUN_FLAG_POLL);
        let end = loop {
            tokio::select! {
                end = &mut session => break end,
                _ = flag_poll.tick() => {
                    if !self.run_flag.is_collecting() && !session_cancel.is_cancelled() {
                        tracing::debug!("Run flag lowered, closing session");
                        session_cancel.cancel();
                    }
                }
            }
        };

        let _ = self.state.update(|state| match state {
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Stopping => {
                Some(ConnectionState::Stopped)
            }
            ConnectionState::Disconnected | ConnectionState::Stopped => None,
        });
        lock(&self.session).take();
        end
    }

    /// Ask the broker session to close.
    ///
    /// Idempotent: returns `false` without doing anything when a disconnect
    /// is already under way or the link is down.
    pub fn disconnect(&self) -> bool {
        let session = {
            let slot = lock(&self.session);
            let claimed = self.state.update(|state| match state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    Some(ConnectionState::Stopping)
                }
                _ => None,
            });
            if let Err(state) = claimed {
                tracing::debug!("disconnect() ignored in state {:?}", state);
                return false;
            }
            slot.clone()
        };

        // No session yet: connect() sends the request once it has one.
        if let Some(session) = session {
            session.request_disconnect();
        }
        true
    }
}

impl BrokerEvents for Subscriber {
    fn on_connected(&self, filter: &str) {
        let _ = self.state.update(|state| match state {
            ConnectionState::Connecting => Some(ConnectionState::Connected),
            _ => None,
        });
        tracing::info!("Subscribed to {} (type q + Enter to stop)", filter);
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        self.counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        if !self.run_flag.is_collecting() {
            self.counters
                .ignored_after_stop
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(topic = %topic, "collection stopped, ignoring message");
            return;
        }

        let value = match decode_reading(payload, &self.value_field) {
            Ok(value) => value,
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to process message from {}: {}", topic, e);
                return;
            }
        };

        let sample = Sample::now(value);
        if self.writer.append(topic, sample) {
            self.counters
                .samples_recorded
                .fetch_add(1, Ordering::Relaxed);
            tracing::info!("[{}] {} -> {} m", topic, sample.timestamp_string(), value);
        } else {
            self.counters
                .ignored_after_stop
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_disconnected(&self) {
        let previous = self.state.update(|state| match state {
            ConnectionState::Stopping => Some(ConnectionState::Stopped),
            ConnectionState::Connecting | ConnectionState::Connected => {
                Some(ConnectionState::Disconnected)
            }
            ConnectionState::Disconnected | ConnectionState::Stopped => None,
        });

        match previous {
            Ok(ConnectionState::Stopping) => tracing::info!("Disconnected from broker"),
            Ok(_) if self.run_flag.is_collecting() => {
                tracing::warn!("Connection to broker lost");
                self.stop.request(StopTrigger::BrokerDisconnect);
            }
            Ok(_) => tracing::info!("Disconnected from broker"),
            Err(_) => {}
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
