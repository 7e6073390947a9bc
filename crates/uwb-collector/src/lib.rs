// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UWB Range Collector
//!
//! Subscribes to a tree of MQTT topics, buffers every distance reading per
//! topic in memory and writes one CSV file per topic when collection stops.
//!
//! # Features
//!
//! - **Wildcard subscription** -- `<prefix>/#`, samples keyed by exact topic
//! - **Isolated decoding** -- a malformed payload drops that message only
//! - **Single stop path** -- `q` on the console, Ctrl+C or a broker
//!   disconnect all drain the run and export exactly once
//! - **Per-topic CSV export** -- one failing file never blocks the others
//!
//! # Architecture
//!
//! ```text
//! LifecycleController
//! +-- network unit   Subscriber over a BrokerTransport (rumqttc or mock)
//! +-- console unit   OperatorConsole waiting for "q"
//! +-- TopicBuffer    sealed at stop, handed to the Exporter
//! ```
//!
//! # Example
//!
//! ```ignore
//! use uwb_collector::{Config, ControllerOptions, CsvExporter, LifecycleController,
//!     MqttTransport, OperatorConsole};
//!
//! let config = Config::from_file("config/config.yaml".as_ref())?;
//! let controller = LifecycleController::new(ControllerOptions::from_config(&config));
//! let report = controller
//!     .run(
//!         MqttTransport::new(config.mqtt.clone()),
//!         OperatorConsole::stdin()?,
//!         &CsvExporter::new(),
//!         async { let _ = tokio::signal::ctrl_c().await; },
//!     )
//!     .await;
//! ```

pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod mqtt;
pub mod sample;
pub mod subscriber;
pub mod transport;

pub use codec::decode_reading;
pub use config::{Config, DataConfig, MqttConfig};
pub use console::{is_stop_command, OperatorConsole};
pub use error::{ConfigError, ConnectionError, DecodeError, ExportError};
pub use export::{CsvExporter, ExportReport, Exporter};
pub use lifecycle::{
    ControllerOptions, LifecycleController, Phase, RunFlag, RunReport, StopHandle, StopTrigger,
    UnitExit,
};
pub use mqtt::MqttTransport;
pub use sample::{Sample, TopicBuffer, TopicSeries, TopicWriter};
pub use subscriber::{ConnectionState, Subscriber, SubscriberStats};
pub use transport::{
    BrokerEvents, BrokerTransport, MockBroker, MockTransport, SessionControl, SessionEnd,
};
