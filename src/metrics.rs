//! Named metric topics with plain-text rendering.
//!
//! Components register topics on a [`Scoreboard`]; whoever hosts them decides
//! how and when to display the values.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

type Fetcher = Arc<dyn Fn() -> String + Send + Sync>;

/// A single named metric.
#[derive(Clone)]
pub struct MetricTopic {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    fetcher: Fetcher,
}

impl MetricTopic {
    pub fn new(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        fetcher: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            fetcher: Arc::new(fetcher),
        }
    }

    /// Current value as text.
    pub fn plain_text(&self) -> String {
        (self.fetcher)()
    }
}

impl std::fmt::Debug for MetricTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricTopic")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Registry of metric topics.
#[derive(Debug, Default)]
pub struct Scoreboard {
    topics: Vec<MetricTopic>,
}

impl Scoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_topic(&mut self, topic: MetricTopic) {
        self.topics.push(topic);
    }

    /// `(name, value)` for every topic, in registration order.
    pub fn snapshot(&self) -> Vec<(&'static str, String)> {
        self.topics.iter().map(|t| (t.name, t.plain_text())).collect()
    }

    /// Log every topic at info level.
    pub fn log_snapshot(&self) {
        for topic in &self.topics {
            info!(
                metric = topic.name,
                value = %topic.plain_text(),
                "{}",
                topic.display_name
            );
        }
    }
}

/// Background task logging the scoreboard at a fixed interval.
///
/// An interval of zero disables reporting and returns immediately.
pub async fn report_task(board: Arc<Scoreboard>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    // First tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        board.log_snapshot();
    }
}
