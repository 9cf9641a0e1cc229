// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-operation lifecycle events.
//!
//! The coordination loop reports what every named operation is doing (queued,
//! negotiating, waiting for its input, executing) to an optional [`TimelineSink`].
//! [`ChromeTimeline`] writes them in the Chrome trace event format, viewable in
//! `chrome://tracing` or Perfetto. Without a sink every call is a no-op.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Trace event phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "E")]
    End,
    #[serde(rename = "i")]
    Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    /// Operation name; empty for job-wide markers.
    pub tensor: String,
    pub phase: Phase,
    pub activity: Option<String>,
    pub args: Option<Value>,
    /// Microseconds since the timeline was opened.
    pub timestamp_us: u64,
}

/// Receives lifecycle events from the coordination loop thread.
pub trait TimelineSink: Send {
    fn record(&mut self, event: &TimelineEvent);

    fn flush(&mut self) {}
}

/// Chrome trace writer. Every operation name gets its own row.
pub struct ChromeTimeline {
    writer: BufWriter<File>,
    rows: HashMap<String, usize>,
    last_flush: Instant,
    failed: bool,
}

impl ChromeTimeline {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(b"[\n")?;
        Ok(Self {
            writer,
            rows: HashMap::new(),
            last_flush: Instant::now(),
            failed: false,
        })
    }

    fn row(&mut self, tensor: &str) -> std::io::Result<usize> {
        if let Some(pid) = self.rows.get(tensor) {
            return Ok(*pid);
        }
        let pid = self.rows.len() + 1;
        self.rows.insert(tensor.to_string(), pid);
        self.write(&json!({"name": "process_name", "ph": "M", "pid": pid, "args": {"name": tensor}}))?;
        self.write(&json!({"name": "process_sort_index", "ph": "M", "pid": pid, "args": {"sort_index": pid}}))?;
        Ok(pid)
    }

    fn write(&mut self, value: &Value) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, value)?;
        self.writer.write_all(b",\n")
    }

    fn try_record(&mut self, event: &TimelineEvent) -> std::io::Result<()> {
        let mut value = if event.tensor.is_empty() {
            json!({"ph": event.phase, "ts": event.timestamp_us, "s": "g"})
        } else {
            let pid = self.row(&event.tensor)?;
            json!({"ph": event.phase, "ts": event.timestamp_us, "pid": pid})
        };
        if let Some(activity) = &event.activity {
            value["name"] = Value::from(activity.as_str());
        }
        if let Some(args) = &event.args {
            value["args"] = args.clone();
        }
        self.write(&value)?;

        if self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.writer.flush()?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }
}

impl TimelineSink for ChromeTimeline {
    fn record(&mut self, event: &TimelineEvent) {
        if self.failed {
            return;
        }
        if let Err(e) = self.try_record(event) {
            tracing::warn!(error = %e, "timeline write failed; disabling timeline");
            self.failed = true;
        }
    }

    fn flush(&mut self) {
        if !self.failed && self.writer.flush().is_err() {
            self.failed = true;
        }
    }
}

/// Front end used by the loop.
pub struct Timeline {
    sink: Option<Box<dyn TimelineSink>>,
    epoch: Instant,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Timeline {
    pub fn disabled() -> Self {
        Self {
            sink: None,
            epoch: Instant::now(),
        }
    }

    pub fn new(sink: Box<dyn TimelineSink>) -> Self {
        Self {
            sink: Some(sink),
            epoch: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn start(&mut self, tensor: &str, activity: &str) {
        self.emit(tensor, Phase::Begin, Some(activity), None);
    }

    pub fn end(&mut self, tensor: &str, args: Option<Value>) {
        self.emit(tensor, Phase::End, None, args);
    }

    pub fn instant(&mut self, tensor: &str, label: &str) {
        self.emit(tensor, Phase::Instant, Some(label), None);
    }

    pub fn mark_cycle(&mut self) {
        self.emit("", Phase::Instant, Some("CYCLE_START"), None);
    }

    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush();
        }
    }

    fn emit(&mut self, tensor: &str, phase: Phase, activity: Option<&str>, args: Option<Value>) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let event = TimelineEvent {
            tensor: tensor.to_string(),
            phase,
            activity: activity.map(str::to_string),
            args,
            timestamp_us: self.epoch.elapsed().as_micros() as u64,
        };
        sink.record(&event);
    }
}
