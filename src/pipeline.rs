//! The polling ingestion loop.
//!
//! One cycle walks every configured [`Resource`] through
//! `FETCHING -> NORMALIZING -> WRITING`, then the loop sleeps for the
//! configured interval. Fetch and write failures abandon only the resource
//! they hit; the next cycle is the retry. Cancellation is the only way to
//! reach [`Phase::Stopped`] (besides an explicit cycle limit) and is honoured
//! before every fetch and during the sleep.

use anyhow::{Result, bail};
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::gbfs::FeedSource;
use crate::normalize::FeedKind;
use crate::sink::{Sink, WriteDisposition};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Normalizing,
    Writing,
    Sleeping,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Fetching => "FETCHING",
            Self::Normalizing => "NORMALIZING",
            Self::Writing => "WRITING",
            Self::Sleeping => "SLEEPING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Runs `fut` unless `ct` fires first, in which case `fut` is dropped and an
/// error naming `what` is returned. For one-shot work that has no
/// cancellation points of its own.
pub async fn until_cancelled<T>(
    ct: &CancellationToken,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = ct.cancelled() => bail!("interrupted during {what}"),
        res = fut => res,
    }
}

/// A feed loaded into a destination table with a fixed disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub table: String,
    pub feed: FeedKind,
    pub disposition: WriteDisposition,
}

impl Resource {
    /// Station reference data, upserted on `station_id`.
    pub fn station_info() -> Self {
        Self {
            table: "station_info".into(),
            feed: FeedKind::StationInformation,
            disposition: WriteDisposition::Merge {
                primary_key: "station_id".into(),
            },
        }
    }

    /// Station availability time series, append-only.
    pub fn station_data() -> Self {
        Self {
            table: "station_data".into(),
            feed: FeedKind::StationStatus,
            disposition: WriteDisposition::Append,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub interval: Duration,
    /// Stop after this many cycles; 0 runs until cancelled.
    pub max_cycles: usize,
    pub resources: Vec<Resource>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_cycles: 0,
            resources: vec![Resource::station_info(), Resource::station_data()],
        }
    }
}

/// What happened to one resource during one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOutcome {
    Written(usize),
    /// Normalization produced no rows; the sink was not called.
    Empty,
    FetchFailed,
    WriteFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: usize,
    pub writes: usize,
    pub rows_written: usize,
    pub empty: usize,
    pub fetch_failures: usize,
    pub write_failures: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &ResourceOutcome) {
        match outcome {
            ResourceOutcome::Written(rows) => {
                self.writes += 1;
                self.rows_written += rows;
            }
            ResourceOutcome::Empty => self.empty += 1,
            ResourceOutcome::FetchFailed => self.fetch_failures += 1,
            ResourceOutcome::WriteFailed => self.write_failures += 1,
        }
    }
}

pub struct Pipeline {
    source: Arc<dyn FeedSource>,
    sink: Arc<dyn Sink>,
    config: PipelineConfig,
    phase: watch::Sender<Phase>,
}

impl Pipeline {
    pub fn new(source: Arc<dyn FeedSource>, sink: Arc<dyn Sink>, config: PipelineConfig) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            source,
            sink,
            config,
            phase,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver that observes every phase transition.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn transition(&self, next: Phase) {
        let prev = self.phase.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "Phase transition");
        }
    }

    /// Runs cycles until `ct` is cancelled or the cycle limit is reached.
    #[tracing::instrument(skip_all, fields(interval_secs = self.config.interval.as_secs(), max_cycles = self.config.max_cycles))]
    pub async fn run(&self, ct: CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();

        if self.config.max_cycles == 0 {
            info!("Polling until cancelled. Press Ctrl+C to stop.");
        }

        loop {
            if ct.is_cancelled() {
                break;
            }

            summary.cycles += 1;
            let cycle = summary.cycles;
            let outcomes = self
                .run_cycle(&ct)
                .instrument(info_span!("cycle", cycle))
                .await;
            for outcome in &outcomes {
                summary.record(outcome);
            }

            if self.config.max_cycles > 0 && summary.cycles >= self.config.max_cycles {
                break;
            }

            self.transition(Phase::Sleeping);
            tokio::select! {
                _ = ct.cancelled() => {
                    info!("Cancelled while sleeping");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        self.transition(Phase::Stopped);
        info!(
            cycles = summary.cycles,
            writes = summary.writes,
            rows = summary.rows_written,
            fetch_failures = summary.fetch_failures,
            write_failures = summary.write_failures,
            "Pipeline stopped"
        );
        summary
    }

    /// Runs every resource once. All rows of the cycle share one ingestion
    /// timestamp. Resources not yet started when `ct` fires are skipped.
    pub async fn run_cycle(&self, ct: &CancellationToken) -> Vec<ResourceOutcome> {
        let time = Utc::now();
        let mut outcomes = Vec::with_capacity(self.config.resources.len());

        for resource in &self.config.resources {
            if ct.is_cancelled() {
                info!(table = %resource.table, "Cancelled before fetch");
                break;
            }
            let span = info_span!("resource", table = %resource.table, feed = resource.feed.feed_name());
            let outcome = self.run_resource(resource, time).instrument(span).await;
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn run_resource(
        &self,
        resource: &Resource,
        time: chrono::DateTime<Utc>,
    ) -> ResourceOutcome {
        self.transition(Phase::Fetching);
        let snapshot = match self.source.fetch(resource.feed.feed_name()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Feed fetch failed, skipping until next cycle");
                return ResourceOutcome::FetchFailed;
            }
        };

        self.transition(Phase::Normalizing);
        let rows = resource.feed.normalize(&snapshot, time);

        self.transition(Phase::Writing);
        if rows.is_empty() {
            warn!("No rows after normalization, nothing to write");
            return ResourceOutcome::Empty;
        }

        match self
            .sink
            .write(&resource.table, &rows, &resource.disposition)
            .await
        {
            Ok(written) => {
                info!(rows = written, disposition = %resource.disposition, "Rows written");
                ResourceOutcome::Written(written)
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Sink write failed, skipping until next cycle");
                ResourceOutcome::WriteFailed
            }
        }
    }
}
