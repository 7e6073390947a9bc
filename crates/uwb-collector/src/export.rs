// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CSV export of the final topic buffer.
//!
//! One file per topic, named after the topic with path separators replaced
//! by `_`. Topics without samples produce no file, and a failure on one
//! topic is logged and recorded without stopping the others.

use crate::error::ExportError;
use crate::sample::{Sample, TopicSeries};
use std::path::{Path, PathBuf};

/// CSV header row.
pub const CSV_HEADER: [&str; 2] = ["Timestamp", "Distance (m)"];

/// Renders the buffer once the run has stopped.
pub trait Exporter: Send + Sync {
    /// Export every non-empty topic of `series` under the directory derived
    /// from `output`.
    fn export(&self, series: &TopicSeries, output: &Path) -> ExportReport;
}

/// Outcome of an export.
#[derive(Debug, Default)]
pub struct ExportReport {
    /// Files written, in topic order.
    pub written: Vec<PathBuf>,
    /// Topics that could not be written.
    pub failed: Vec<(String, ExportError)>,
    /// Topics skipped because they held no sample.
    pub skipped_empty: Vec<String>,
}

impl ExportReport {
    /// No topic failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Directory the files go to: the parent of a file-like path (one with an
/// extension), the path itself otherwise.
pub fn output_dir(output: &Path) -> PathBuf {
    if output.extension().is_some() {
        match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    } else {
        output.to_path_buf()
    }
}

/// `uwb/ancora1/data` -> `uwb_ancora1_data.csv`
pub fn file_name_for(topic: &str) -> String {
    format!("{}.csv", topic.replace(['/', '\\'], "_"))
}

/// Writes `Timestamp,Distance (m)` files with the `csv` crate.
#[derive(Debug, Default, Clone)]
pub struct CsvExporter;

impl CsvExporter {
    pub fn new() -> Self {
        Self
    }

    fn write_topic(
        &self,
        dir: &Path,
        topic: &str,
        samples: &[Sample],
    ) -> Result<PathBuf, ExportError> {
        let path = dir.join(file_name_for(topic));
        let csv_error = |source: csv::Error| ExportError::Csv {
            path: path.clone(),
            source,
        };

        let mut writer = csv::Writer::from_path(&path).map_err(csv_error)?;
        writer.write_record(CSV_HEADER).map_err(csv_error)?;
        for sample in samples {
            writer
                .write_record([sample.timestamp_string(), format!("{:?}", sample.value)])
                .map_err(csv_error)?;
        }
        writer.flush().map_err(|source| ExportError::Flush {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }
}

impl Exporter for CsvExporter {
    fn export(&self, series: &TopicSeries, output: &Path) -> ExportReport {
        let mut report = ExportReport::default();

        let (pending, empty): (Vec<_>, Vec<_>) =
            series.iter().partition(|(_, samples)| !samples.is_empty());
        report.skipped_empty = empty.into_iter().map(|(topic, _)| topic.clone()).collect();

        if pending.is_empty() {
            tracing::info!("No data collected, nothing to export");
            return report;
        }

        let dir = output_dir(output);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!("Cannot create output directory {}: {}", dir.display(), e);
            for (topic, _) in pending {
                report.failed.push((
                    topic.clone(),
                    ExportError::CreateDir {
                        path: dir.clone(),
                        source: std::io::Error::new(e.kind(), e.to_string()),
                    },
                ));
            }
            return report;
        }

        for (topic, samples) in pending {
            match self.write_topic(&dir, topic, samples) {
                Ok(path) => {
                    tracing::info!(
                        "Saved {} samples from {} to {}",
                        samples.len(),
                        topic,
                        path.display()
                    );
                    report.written.push(path);
                }
                Err(e) => {
                    tracing::error!("Export of {} failed: {}", topic, e);
                    report.failed.push((topic.clone(), e));
                }
            }
        }

        report
    }
}
