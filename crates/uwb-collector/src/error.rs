// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the collector.
//!
//! Only [`ConnectionError`] ends a run. Decode and export failures are
//! contained where they happen: one bad message or one unwritable file
//! never affects the others.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Broker link failures. Fatal to the run, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid broker settings: {0}")]
    InvalidSettings(String),

    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?} waiting for the broker")]
    Timeout(Duration),

    #[error("Subscription to '{0}' was refused")]
    SubscribeRefused(String),

    #[error("Connection closed before the session was established")]
    Closed,
}

/// Per-message payload failures. The message is dropped, the run goes on.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("field '{field}' is not numeric: {value}")]
    NotNumeric { field: String, value: String },
}

/// Per-topic export failures. Remaining topics are still written.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot create output directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("cannot flush {}: {source}", path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::SubscribeRefused("uwb/#".to_string());
        assert_eq!(err.to_string(), "Subscription to 'uwb/#' was refused");

        let err = ConnectionError::Timeout(Duration::from_secs(10));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_decode_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: DecodeError = json_err.into();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn test_export_error_mentions_path() {
        let err = ExportError::CreateDir {
            path: PathBuf::from("/tmp/out"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/out"));
        assert!(msg.contains("denied"));
    }
}
