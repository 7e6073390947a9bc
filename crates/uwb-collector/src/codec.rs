// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload decoding.
//!
//! Payloads are JSON objects such as `{"distance": 1.42}`. A missing field
//! reads as `0.0`, so a lost key can't be told apart from a genuine zero.

use crate::error::DecodeError;
use serde_json::Value;

/// Extract the numeric reading stored under `field`.
pub fn decode_reading(payload: &[u8], field: &str) -> Result<f64, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let document: Value = serde_json::from_str(text)?;
    let object = document.as_object().ok_or(DecodeError::NotAnObject)?;

    match object.get(field) {
        None => Ok(0.0),
        Some(value) => coerce(value).ok_or_else(|| DecodeError::NotNumeric {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Numbers, numeric strings and booleans convert; everything else doesn't.
fn coerce(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
