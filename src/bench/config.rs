//! Load generator parameters and command-line surface.

use crate::error::BenchError;
use crate::protocols::forward::{Record, Value};
use clap::Parser;
use std::time::Duration;

/// How each batch is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Encoding {
    /// One Message frame per record
    Message,
    /// One Forward frame per batch
    Forward,
    /// One PackedForward frame per batch
    PackedForward,
}

/// Command-line arguments for the load generator
#[derive(Parser, Debug)]
#[command(name = "forward-bench")]
#[command(version = "0.1.0")]
#[command(about = "Load generator for forward protocol collectors", long_about = None)]
pub struct BenchArgs {
    /// Tag attached to every record
    pub tag: String,

    /// Total number of records to send
    pub count: usize,

    /// Collector address
    #[arg(long, default_value = "localhost:24224")]
    pub host: String,

    /// Records sent per batch
    #[arg(long, default_value_t = 1)]
    pub multi: usize,

    /// Number of concurrent connections
    #[arg(long, default_value_t = 1)]
    pub concurrent: usize,

    /// Frame each record separately (same as --encoding message)
    #[arg(long)]
    pub no_packed: bool,

    /// Batch framing
    #[arg(long, value_enum, default_value_t = Encoding::Forward)]
    pub encoding: Encoding,

    /// Record payload as a JSON object
    #[arg(long, default_value = r#"{ "message": "test" }"#)]
    pub data: String,

    /// Failed dials tolerated per worker before giving up
    #[arg(long, default_value_t = 5)]
    pub max_retries: usize,

    /// Wait between failed dials, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub retry_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl BenchArgs {
    /// Validate the arguments and turn them into run parameters.
    pub fn into_params(self) -> Result<BenchParams, BenchError> {
        let json: serde_json::Value = serde_json::from_str(&self.data)
            .map_err(|e| BenchError::Configuration(format!("invalid --data: {e}")))?;
        let payload = match Value::from(json) {
            Value::Map(record) => record,
            other => {
                return Err(BenchError::Configuration(format!(
                    "--data must be a JSON object, got {}",
                    other.kind()
                )))
            }
        };

        let params = BenchParams {
            host: self.host,
            encoding: if self.no_packed {
                Encoding::Message
            } else {
                self.encoding
            },
            total_records: self.count,
            records_per_batch: self.multi,
            concurrency: self.concurrent,
            tag: self.tag,
            payload,
            max_retries: self.max_retries,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        };
        params.validate()?;
        Ok(params)
    }
}

/// One load generation run.
#[derive(Debug, Clone)]
pub struct BenchParams {
    pub host: String,
    pub encoding: Encoding,
    pub total_records: usize,
    pub records_per_batch: usize,
    pub concurrency: usize,
    pub tag: String,
    pub payload: Record,
    pub max_retries: usize,
    pub retry_interval: Duration,
}

impl BenchParams {
    /// Reject combinations that cannot be split evenly into batches and workers.
    pub fn validate(&self) -> Result<(), BenchError> {
        if self.records_per_batch == 0 {
            return Err(BenchError::Configuration(
                "the value of 'multi' must be greater than zero".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(BenchError::Configuration(
                "the value of 'concurrent' must be greater than zero".to_string(),
            ));
        }
        if self.total_records % self.records_per_batch != 0 {
            return Err(BenchError::Configuration(
                "the value of 'count' must be a multiple of 'multi'".to_string(),
            ));
        }
        if self.attempts() < self.concurrency {
            return Err(BenchError::Configuration(
                "the division of 'count' by 'multi' must be equal to or greater than 'concurrent'"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Number of batches in the whole run.
    pub fn attempts(&self) -> usize {
        self.total_records / self.records_per_batch
    }
}

/// Spread `attempts` over `workers`; the first `attempts % workers` get one extra.
pub fn split_attempts(attempts: usize, workers: usize) -> Vec<usize> {
    if workers == 0 {
        return Vec::new();
    }
    let base = attempts / workers;
    let remainder = attempts % workers;
    (0..workers)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(count: usize, multi: usize, concurrent: usize) -> BenchParams {
        BenchParams {
            host: "localhost:24224".to_string(),
            encoding: Encoding::Forward,
            total_records: count,
            records_per_batch: multi,
            concurrency: concurrent,
            tag: "t".to_string(),
            payload: Record::new(),
            max_retries: 5,
            retry_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_split_attempts() {
        assert_eq!(split_attempts(10, 3), vec![4, 3, 3]);
        assert_eq!(split_attempts(9, 3), vec![3, 3, 3]);
        assert_eq!(split_attempts(5, 1), vec![5]);
        assert_eq!(split_attempts(7, 4), vec![2, 2, 2, 1]);
        assert_eq!(split_attempts(3, 0), Vec::<usize>::new());
    }

    #[test]
    fn test_validate_scenarios() {
        let p = params(100, 10, 3);
        assert!(p.validate().is_ok());
        assert_eq!(p.attempts(), 10);
        assert_eq!(split_attempts(p.attempts(), p.concurrency), vec![4, 3, 3]);

        assert!(matches!(
            params(100, 7, 1).validate(),
            Err(BenchError::Configuration(_))
        ));
        assert!(matches!(
            params(10, 5, 3).validate(),
            Err(BenchError::Configuration(_))
        ));
        assert!(matches!(
            params(10, 0, 1).validate(),
            Err(BenchError::Configuration(_))
        ));
        assert!(matches!(
            params(10, 1, 0).validate(),
            Err(BenchError::Configuration(_))
        ));
    }

    #[test]
    fn test_args_defaults() {
        let args = BenchArgs::parse_from(["forward-bench", "app.log", "100"]);
        let p = args.into_params().unwrap();
        assert_eq!(p.host, "localhost:24224");
        assert_eq!(p.encoding, Encoding::Forward);
        assert_eq!(p.records_per_batch, 1);
        assert_eq!(p.concurrency, 1);
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.payload["message"], Value::from("test"));
    }

    #[test]
    fn test_args_no_packed() {
        let args = BenchArgs::parse_from([
            "forward-bench",
            "--no-packed",
            "--multi",
            "10",
            "--concurrent",
            "3",
            "t",
            "100",
        ]);
        let p = args.into_params().unwrap();
        assert_eq!(p.encoding, Encoding::Message);
        assert_eq!(p.records_per_batch, 10);
        assert_eq!(p.concurrency, 3);
    }

    #[test]
    fn test_args_rejected() {
        let args = BenchArgs::parse_from(["forward-bench", "--multi", "7", "t", "100"]);
        assert!(matches!(
            args.into_params(),
            Err(BenchError::Configuration(_))
        ));

        let args = BenchArgs::parse_from(["forward-bench", "--data", "[1,2]", "t", "1"]);
        assert!(matches!(
            args.into_params(),
            Err(BenchError::Configuration(_))
        ));

        let args = BenchArgs::parse_from(["forward-bench", "--data", "{oops", "t", "1"]);
        assert!(matches!(
            args.into_params(),
            Err(BenchError::Configuration(_))
        ));
    }

    #[test]
    fn test_encoding_value_names() {
        let args =
            BenchArgs::parse_from(["forward-bench", "--encoding", "packed-forward", "t", "1"]);
        assert_eq!(args.encoding, Encoding::PackedForward);
    }
}
