// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Samples and the per-topic buffer.
//!
//! The buffer is owned by the lifecycle controller. The subscriber only
//! receives a [`TopicWriter`], which can append and nothing else. Once the
//! controller seals the buffer for export, later appends are dropped.

use chrono::{DateTime, Local};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Topic name to its samples, in arrival order. Sorted by topic so exports
/// are deterministic.
pub type TopicSeries = BTreeMap<String, Vec<Sample>>;

/// Local ISO-8601 with microseconds, no offset.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// One reading taken from an inbound message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Reception time.
    pub timestamp: DateTime<Local>,
    /// Decoded reading.
    pub value: f64,
}

impl Sample {
    /// Stamp a reading with the current local time.
    pub fn now(value: f64) -> Self {
        Self {
            timestamp: Local::now(),
            value,
        }
    }

    /// Timestamp rendered with [`TIMESTAMP_FORMAT`].
    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

#[derive(Default)]
struct BufferInner {
    series: HashMap<String, Vec<Sample>>,
    sealed: bool,
    rejected: u64,
}

/// In-memory store of samples keyed by exact topic.
#[derive(Clone, Default)]
pub struct TopicBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

/// Append-only handle into a [`TopicBuffer`].
#[derive(Clone)]
pub struct TopicWriter {
    inner: Arc<Mutex<BufferInner>>,
}

fn lock(inner: &Mutex<BufferInner>) -> MutexGuard<'_, BufferInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn append(inner: &Mutex<BufferInner>, topic: &str, sample: Sample) -> bool {
    let mut guard = lock(inner);
    if guard.sealed {
        guard.rejected += 1;
        tracing::trace!(topic = %topic, "buffer sealed, dropping sample");
        return false;
    }
    match guard.series.get_mut(topic) {
        Some(samples) => samples.push(sample),
        None => {
            guard.series.insert(topic.to_string(), vec![sample]);
        }
    }
    true
}

impl TopicBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out an append-only writer.
    pub fn writer(&self) -> TopicWriter {
        TopicWriter {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Append a sample under `topic`, creating the topic entry on first use.
    ///
    /// Returns `false` only once the buffer has been sealed.
    pub fn append(&self, topic: &str, sample: Sample) -> bool {
        append(&self.inner, topic, sample)
    }

    /// Copy of the current contents. The buffer keeps accepting appends.
    pub fn snapshot(&self) -> TopicSeries {
        let guard = lock(&self.inner);
        guard
            .series
            .iter()
            .map(|(topic, samples)| (topic.clone(), samples.clone()))
            .collect()
    }

    /// Seal the buffer and move its contents out.
    ///
    /// Appends racing past this point are rejected. Sealing twice yields an
    /// empty series the second time.
    pub fn seal(&self) -> TopicSeries {
        let mut guard = lock(&self.inner);
        guard.sealed = true;
        std::mem::take(&mut guard.series).into_iter().collect()
    }

    /// Whether [`seal`](Self::seal) has been called.
    pub fn is_sealed(&self) -> bool {
        lock(&self.inner).sealed
    }

    /// Total number of buffered samples across all topics.
    pub fn len(&self) -> usize {
        lock(&self.inner).series.values().map(Vec::len).sum()
    }

    /// Check if no sample has been buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct topics seen.
    pub fn topic_count(&self) -> usize {
        lock(&self.inner).series.len()
    }

    /// Appends refused because the buffer was sealed.
    pub fn rejected(&self) -> u64 {
        lock(&self.inner).rejected
    }
}

impl TopicWriter {
    /// Append a sample under `topic`. See [`TopicBuffer::append`].
    pub fn append(&self, topic: &str, sample: Sample) -> bool {
        append(&self.inner, topic, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_append_preserves_arrival_order() {
        let buffer = TopicBuffer::new();
        let writer = buffer.writer();

        for i in 0..50 {
            assert!(writer.append("uwb/ancora1/data", Sample::now(i as f64)));
        }

        let series = buffer.snapshot();
        let values: Vec<f64> = series["uwb/ancora1/data"].iter().map(|s| s.value).collect();
        let expected: Vec<f64> = (0..50).map(|i| i as f64).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_timestamp_string_format() {
        let timestamp = Local.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let sample = Sample {
            timestamp,
            value: 1.0,
        };
        assert_eq!(sample.timestamp_string(), "2025-03-14T09:26:53.000000");
    }

    #[test]
    fn test_topics_are_kept_apart() {
        let buffer = TopicBuffer::new();
        buffer.append("uwb/a", Sample::now(1.0));
        buffer.append("uwb/b", Sample::now(2.0));
        buffer.append("uwb/a", Sample::now(3.0));

        assert_eq!(buffer.topic_count(), 2);
        assert_eq!(buffer.len(), 3);

        let series = buffer.snapshot();
        assert_eq!(series["uwb/a"].len(), 2);
        assert_eq!(series["uwb/b"].len(), 1);
    }

    #[test]
    fn test_snapshot_does_not_drain() {
        let buffer = TopicBuffer::new();
        buffer.append("t", Sample::now(1.0));

        let first = buffer.snapshot();
        buffer.append("t", Sample::now(2.0));
        let second = buffer.snapshot();

        assert_eq!(first["t"].len(), 1);
        assert_eq!(second["t"].len(), 2);
        assert!(!buffer.is_sealed());
    }

    #[test]
    fn test_seal_rejects_later_appends() {
        let buffer = TopicBuffer::new();
        let writer = buffer.writer();
        writer.append("t", Sample::now(1.0));

        let sealed = buffer.seal();
        assert_eq!(sealed["t"].len(), 1);
        assert!(buffer.is_sealed());

        assert!(!writer.append("t", Sample::now(2.0)));
        assert_eq!(buffer.rejected(), 1);
        assert!(buffer.is_empty());
        assert!(buffer.seal().is_empty());
    }

    #[test]
    fn test_concurrent_writer_and_terminal_reader() {
        let buffer = TopicBuffer::new();
        let writer = buffer.writer();

        let producer = std::thread::spawn(move || {
            let mut accepted = 0u64;
            for i in 0..10_000 {
                if writer.append("uwb/tag", Sample::now(i as f64)) {
                    accepted += 1;
                }
            }
            accepted
        });

        // Let the producer get going before sealing mid-stream.
        while buffer.len() < 100 {
            std::thread::yield_now();
        }
        let sealed = buffer.seal();
        let accepted = producer.join().unwrap();

        let samples = &sealed["uwb/tag"];
        assert_eq!(samples.len() as u64, accepted);
        assert_eq!(accepted + buffer.rejected(), 10_000);
        assert!(samples.windows(2).all(|w| w[0].value < w[1].value));
    }
}
