//! Downstream sinks that receive decoded entries.
//!
//! A sink gets each frame's entries as one ordered batch. Sinks must not
//! block the connection handler indefinitely.

use crate::protocols::forward::Entry;
use serde::Deserialize;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Consumer of decoded entries.
pub trait Sink: Send + Sync {
    /// Accept one frame's entries, in decode order.
    fn emit(&self, entries: Vec<Entry>);
}

/// Which sink the server binary writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// JSON lines on stdout
    Stdout,
    /// One log line per entry
    Log,
    /// Drop everything (throughput testing)
    Discard,
}

/// Build the sink selected by configuration.
///
/// Must be called within a Tokio runtime.
pub fn from_kind(kind: OutputKind) -> Arc<dyn Sink> {
    match kind {
        OutputKind::Stdout => Arc::new(JsonLinesSink::spawn(io::stdout()).0),
        OutputKind::Log => Arc::new(LogSink),
        OutputKind::Discard => Arc::new(DiscardSink),
    }
}

/// Writes each entry as a JSON object on its own line.
///
/// Writing happens on the blocking pool, so a slow output never stalls a
/// connection handler. Batches queue in memory until the writer catches up.
pub struct JsonLinesSink {
    tx: mpsc::UnboundedSender<Vec<Entry>>,
}

impl JsonLinesSink {
    /// Start the writer. It runs until every clone of the sink is dropped,
    /// then flushes and hands `out` back through the join handle.
    pub fn spawn<W>(out: W) -> (Self, JoinHandle<W>)
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::task::spawn_blocking(move || write_lines(out, rx));
        (Self { tx }, writer)
    }
}

impl Sink for JsonLinesSink {
    fn emit(&self, entries: Vec<Entry>) {
        if self.tx.send(entries).is_err() {
            warn!("Output writer stopped, dropping entries");
        }
    }
}

fn write_lines<W: Write>(mut out: W, mut rx: mpsc::UnboundedReceiver<Vec<Entry>>) -> W {
    while let Some(entries) = rx.blocking_recv() {
        for entry in &entries {
            let written = serde_json::to_writer(&mut out, entry)
                .map_err(io::Error::from)
                .and_then(|_| out.write_all(b"\n"));
            if let Err(e) = written {
                warn!(error = %e, tag = %entry.tag, "Failed to write entry");
                break;
            }
        }
        if let Err(e) = out.flush() {
            warn!(error = %e, "Failed to flush output");
        }
    }
    out
}

/// Logs every entry at info level.
pub struct LogSink;

impl Sink for LogSink {
    fn emit(&self, entries: Vec<Entry>) {
        for entry in entries {
            let data = serde_json::to_string(&entry.data).unwrap_or_default();
            info!(tag = %entry.tag, timestamp = entry.timestamp, %data, "entry");
        }
    }
}

/// Drops all entries.
pub struct DiscardSink;

impl Sink for DiscardSink {
    fn emit(&self, _entries: Vec<Entry>) {}
}

/// Forwards batches into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<Entry>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<Entry>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn emit(&self, entries: Vec<Entry>) {
        if self.tx.send(entries).is_err() {
            warn!("Entry receiver dropped");
        }
    }
}
