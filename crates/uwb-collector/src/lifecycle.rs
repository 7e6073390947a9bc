// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lifecycle controller
//!
//! Runs the network unit and the console unit side by side, waits for the
//! first stop trigger, drains both units and exports the buffer exactly
//! once.
//!
//! # Phases
//!
//! `Idle -> Running -> StopRequested -> Draining -> Terminated`
//!
//! Stop triggers (operator command, interrupt, broker disconnect) all take
//! the same path. Only the first one counts; later ones are drained and
//! reported as ignored.

use crate::config::{subscription_filter, Config, DEFAULT_VALUE_FIELD};
use crate::console::{watch_for_stop, OperatorConsole};
use crate::error::ConnectionError;
use crate::export::{ExportReport, Exporter};
use crate::sample::TopicBuffer;
use crate::subscriber::{Subscriber, SubscriberStats};
use crate::transport::{BrokerTransport, SessionEnd};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Default bound on each console wait.
pub const DEFAULT_INPUT_POLL: Duration = Duration::from_secs(1);

/// Default time a unit gets to stop after cancellation before it is aborted.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    StopRequested,
    Draining,
    Terminated,
}

/// What ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    /// `q` typed on the console.
    Operator,
    /// Ctrl+C or another interrupt.
    Interrupt,
    /// The broker closed the link.
    BrokerDisconnect,
    /// The session could not be established.
    ConnectionFailed,
}

impl fmt::Display for StopTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopTrigger::Operator => "operator command",
            StopTrigger::Interrupt => "interrupt",
            StopTrigger::BrokerDisconnect => "broker disconnect",
            StopTrigger::ConnectionFailed => "connection failure",
        };
        f.write_str(name)
    }
}

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitExit {
    /// Returned on its own.
    Completed,
    /// Stopped through its cancellation token.
    Cancelled,
    /// Overran the grace period and was aborted.
    Aborted,
    /// Panicked or failed to connect.
    Failed,
}

/// The "collecting" flag. Readable everywhere, lowered only by the
/// controller.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    /// A raised flag.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// `true` until stop has been processed.
    pub fn is_collecting(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Lower the flag. Returns `true` for the call that actually lowered it.
    pub(crate) fn lower(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends stop requests to the controller. Requests after the first are
/// no-ops.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::UnboundedSender<StopTrigger>,
}

impl StopHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<StopTrigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Ask the controller to stop.
    pub fn request(&self, trigger: StopTrigger) {
        if self.tx.send(trigger).is_err() {
            tracing::debug!("stop request ({}) after shutdown, ignored", trigger);
        }
    }
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Topic prefix, subscribed as `<prefix>/#`.
    pub topic_prefix: String,
    /// Output file or directory handed to the exporter.
    pub output_path: PathBuf,
    /// JSON field carrying the reading.
    pub value_field: String,
    /// Bound on each console wait.
    pub input_poll: Duration,
    /// Time each unit gets to stop before it is aborted.
    pub grace_period: Duration,
}

impl ControllerOptions {
    pub fn new(topic_prefix: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            output_path: output_path.into(),
            value_field: DEFAULT_VALUE_FIELD.to_string(),
            input_poll: DEFAULT_INPUT_POLL,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Options taken from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.mqtt.topic.clone(), config.data.data_processed.clone())
            .value_field(config.data.value_field.clone())
    }

    pub fn value_field(mut self, field: impl Into<String>) -> Self {
        self.value_field = field.into();
        self
    }

    pub fn input_poll(mut self, poll: Duration) -> Self {
        self.input_poll = poll;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

/// Summary of a finished run.
#[derive(Debug)]
pub struct RunReport {
    /// The trigger that took effect.
    pub trigger: StopTrigger,
    /// Set when the session never came up.
    pub connection_error: Option<ConnectionError>,
    /// Whether the controller had a live session to disconnect.
    pub disconnect_issued: bool,
    /// Subscriber counters at the end of the run.
    pub stats: SubscriberStats,
    /// Result of the single export.
    pub export: ExportReport,
    /// How the network unit ended.
    pub network: UnitExit,
    /// How the console unit ended.
    pub console: UnitExit,
    /// Stop requests that arrived after the first one.
    pub ignored_triggers: usize,
}

/// Lifecycle controller
pub struct LifecycleController {
    options: ControllerOptions,
    buffer: TopicBuffer,
    run_flag: RunFlag,
    stop: StopHandle,
    stop_rx: mpsc::UnboundedReceiver<StopTrigger>,
    phase: watch::Sender<Phase>,
}

impl LifecycleController {
    /// Create an idle controller.
    pub fn new(options: ControllerOptions) -> Self {
        let (stop, stop_rx) = StopHandle::channel();
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            options,
            buffer: TopicBuffer::new(),
            run_flag: RunFlag::new(),
            stop,
            stop_rx,
            phase,
        }
    }

    /// Handle for requesting a stop from outside the run.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Read-only view of the run flag.
    pub fn run_flag(&self) -> RunFlag {
        self.run_flag.clone()
    }

    /// Follow phase changes.
    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: Phase) {
        tracing::debug!("lifecycle phase -> {:?}", phase);
        self.phase.send_replace(phase);
    }

    /// Collect until the first stop trigger, then drain and export.
    ///
    /// Never fails: connection errors, unit panics and export failures all
    /// end up in the returned [`RunReport`].
    pub async fn run<T, E, F>(
        mut self,
        transport: T,
        console: OperatorConsole,
        exporter: &E,
        interrupt: F,
    ) -> RunReport
    where
        T: BrokerTransport,
        E: Exporter + ?Sized,
        F: Future<Output = ()>,
    {
        let cancel = CancellationToken::new();
        let grace = self.options.grace_period;

        let subscriber = Subscriber::new(
            subscription_filter(&self.options.topic_prefix),
            self.options.value_field.clone(),
            self.buffer.writer(),
            self.run_flag.clone(),
            self.stop.clone(),
        );

        self.set_phase(Phase::Running);
        let mut network = tokio::spawn(network_unit(
            Arc::clone(&subscriber),
            transport,
            cancel.clone(),
        ));
        let mut input = tokio::spawn(watch_for_stop(
            console,
            self.run_flag.clone(),
            self.stop.clone(),
            cancel.clone(),
            self.options.input_poll,
        ));
        tokio::pin!(interrupt);

        let mut network_joined = None;
        let trigger = tokio::select! {
            biased;
            Some(trigger) = self.stop_rx.recv() => trigger,
            _ = &mut interrupt => {
                tracing::info!("Interrupt received");
                StopTrigger::Interrupt
            }
            joined = &mut network => {
                let trigger = match &joined {
                    Ok(Err(_)) => StopTrigger::ConnectionFailed,
                    _ => StopTrigger::BrokerDisconnect,
                };
                network_joined = Some(joined);
                trigger
            }
        };

        self.set_phase(Phase::StopRequested);
        tracing::info!("Stopping collection ({})", trigger);
        if !self.run_flag.lower() {
            tracing::debug!("run flag was already lowered");
        }

        self.set_phase(Phase::Draining);
        let disconnect_issued = subscriber.disconnect();
        cancel.cancel();

        let network_result = match network_joined {
            Some(joined) => joined_unit("network", joined),
            None => join_unit("network", &mut network, grace).await,
        };
        let (network_exit, connection_error) = match network_result {
            Ok(Ok(SessionEnd::Closed)) => (UnitExit::Completed, None),
            Ok(Ok(SessionEnd::Cancelled)) => (UnitExit::Cancelled, None),
            Ok(Err(e)) => (UnitExit::Failed, Some(e)),
            Err(exit) => (exit, None),
        };
        let console_exit = join_unit("console", &mut input, grace)
            .await
            .unwrap_or_else(|exit| exit);

        let mut ignored_triggers = 0;
        while let Ok(extra) = self.stop_rx.try_recv() {
            tracing::debug!("Ignoring additional stop trigger ({})", extra);
            ignored_triggers += 1;
        }

        let series = self.buffer.seal();
        let samples: usize = series.values().map(Vec::len).sum();
        tracing::info!(
            "Exporting {} samples from {} topics to {}",
            samples,
            series.len(),
            self.options.output_path.display()
        );
        let export = exporter.export(&series, &self.options.output_path);

        self.set_phase(Phase::Terminated);
        RunReport {
            trigger,
            connection_error,
            disconnect_issued,
            stats: subscriber.stats(),
            export,
            network: network_exit,
            console: console_exit,
            ignored_triggers,
        }
    }
}

/// Network unit: connect, then receive until the session ends.
async fn network_unit<T: BrokerTransport>(
    subscriber: Arc<Subscriber>,
    mut transport: T,
    cancel: CancellationToken,
) -> Result<SessionEnd, ConnectionError> {
    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        result = subscriber.connect(&mut transport) => result,
    };
    connected?;

    Ok(subscriber.run(&mut transport, cancel).await)
}

/// Wait up to `grace` for a cancelled unit, then abort it.
async fn join_unit<T>(
    name: &str,
    handle: &mut JoinHandle<T>,
    grace: Duration,
) -> Result<T, UnitExit> {
    match tokio::time::timeout(grace, &mut *handle).await {
        Ok(joined) => joined_unit(name, joined),
        Err(_) => {
            tracing::warn!("{} unit did not stop within {:?}, aborting", name, grace);
            handle.abort();
            joined_unit(name, handle.await)
        }
    }
}

fn joined_unit<T>(name: &str, joined: Result<T, JoinError>) -> Result<T, UnitExit> {
    match joined {
        Ok(value) => Ok(value),
        Err(e) if e.is_cancelled() => {
            tracing::debug!("{} unit aborted", name);
            Err(UnitExit::Aborted)
        }
        Err(e) => {
            tracing::error!("{} unit failed: {}", name, e);
            Err(UnitExit::Failed)
        }
    }
}
