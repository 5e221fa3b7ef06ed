//! Concurrent load generator for the forward protocol.
//!
//! The run is split into batches ("attempts") spread over a fixed number of
//! workers. Each worker dials once, within a retry budget, then writes its
//! share of batches over that single connection.

pub mod config;

pub use config::{split_attempts, BenchArgs, BenchParams, Encoding};

use crate::error::{classify, BenchError, TransportClass};
use crate::protocols::forward::{encode_batch, encode_packed, encode_single, Record};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Totals for a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub records: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

impl Report {
    /// Records per second over the whole run.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.records as f64 / secs
        } else {
            0.0
        }
    }
}

/// Run every worker to completion.
///
/// A worker that cannot reach the target aborts the whole run. Any other
/// worker failure ends only that worker; the first such error is returned
/// once the remaining workers finish.
pub async fn run(params: BenchParams) -> Result<Report, BenchError> {
    params.validate()?;

    let shares = split_attempts(params.attempts(), params.concurrency);
    info!(
        host = %params.host,
        encoding = ?params.encoding,
        records = params.total_records,
        batch = params.records_per_batch,
        workers = shares.len(),
        "Starting load generation"
    );

    let params = Arc::new(params);
    let started = Instant::now();
    let mut workers = JoinSet::new();
    for (id, attempts) in shares.into_iter().enumerate() {
        let params = Arc::clone(&params);
        workers.spawn(async move { worker(id, attempts, &params).await });
    }

    let mut batches = 0;
    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(sent)) => batches += sent,
            Ok(Err(e @ BenchError::RetryExhausted { .. })) => {
                warn!(error = %e, "Target unreachable, stopping all workers");
                workers.abort_all();
                return Err(e);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Worker failed");
                first_error.get_or_insert(e);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                warn!(error = %e, "Worker panicked");
                first_error.get_or_insert(BenchError::from(e));
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    Ok(Report {
        records: batches * params.records_per_batch,
        batches,
        elapsed: started.elapsed(),
    })
}

/// One connection's share of the run. Returns the number of batches written.
async fn worker(id: usize, attempts: usize, params: &BenchParams) -> Result<usize, BenchError> {
    let mut stream = dial(id, params).await?;
    debug!(worker = id, attempts, "Connected");

    let mut buf = BytesMut::with_capacity(4096);
    for _ in 0..attempts {
        let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
        encode_frames(&mut buf, params, timestamp)?;
        send(&mut stream, buf.split().freeze())
            .await
            .map_err(|source| BenchError::Transport { worker: id, source })?;
    }

    if let Err(e) = stream.shutdown().await {
        debug!(worker = id, error = %e, "Shutdown failed");
    }
    debug!(worker = id, attempts, "Done");
    Ok(attempts)
}

/// Open a connection, allowing `max_retries` failed dials before giving up.
async fn dial(id: usize, params: &BenchParams) -> Result<TcpStream, BenchError> {
    let mut budget = params.max_retries as i64;
    let mut dials = 0;
    loop {
        dials += 1;
        match TcpStream::connect(params.host.as_str()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                budget -= 1;
                if budget < 0 {
                    return Err(BenchError::RetryExhausted {
                        worker: id,
                        attempts: dials,
                    });
                }
                warn!(worker = id, error = %e, remaining = budget, "Dial failed, retrying");
                tokio::time::sleep(params.retry_interval).await;
            }
        }
    }
}

/// Append one batch to `buf` in the configured framing.
fn encode_frames(
    buf: &mut BytesMut,
    params: &BenchParams,
    timestamp: u64,
) -> Result<(), BenchError> {
    match params.encoding {
        Encoding::Message => {
            for _ in 0..params.records_per_batch {
                encode_single(buf, &params.tag, timestamp, &params.payload)?;
            }
        }
        Encoding::Forward => encode_batch(buf, &params.tag, &batch(params, timestamp))?,
        Encoding::PackedForward => encode_packed(buf, &params.tag, &batch(params, timestamp))?,
    }
    Ok(())
}

fn batch(params: &BenchParams, timestamp: u64) -> Vec<(u64, Record)> {
    (0..params.records_per_batch)
        .map(|_| (timestamp, params.payload.clone()))
        .collect()
}

/// Write the whole frame, retrying temporary failures in place.
async fn send<W>(stream: &mut W, mut frame: Bytes) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while frame.has_remaining() {
        match stream.write_buf(&mut frame).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(_) => {}
            Err(e) if classify(&e) == TransportClass::Temporary => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
