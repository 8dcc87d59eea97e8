//! Batch ingestion engine and periodic refresh policy.
//!
//! The external collector dumps raw API payloads; this crate normalizes
//! them, merges them into the store one record at a time, and reports a
//! per-table run summary. Per-record failures (validation, missing
//! parents) are logged and skipped; only store unavailability aborts a
//! run, leaving already-committed rows in place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;
use ytstats_core::{CommentRecord, Entity, RunSummary, TableCounts};
use ytstats_normalize::{
    normalize_channel_batch, normalize_comment_thread_batch, normalize_video_batch, Normalized,
};
use ytstats_store::{Store, StoreError, UpsertOutcome};

pub const CRATE_NAME: &str = "ytstats-sync";

/// Whether comments on an already-collected video are re-fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentRefresh {
    Always,
    Never,
}

/// What the collector should fetch for a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFetchScope {
    /// New video: everything, immutable fields included.
    Full,
    /// Known video: only the comment delta.
    CommentsOnly,
    /// Known video, comment refresh disabled: nothing to do.
    Skip,
}

/// Pure decision function over collection dates and configuration.
/// Annual refresh is the project default.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub interval_days: i64,
    pub comment_refresh: CommentRefresh,
}

impl RefreshPolicy {
    pub fn annual() -> Self {
        Self {
            interval_days: 365,
            comment_refresh: CommentRefresh::Always,
        }
    }

    pub fn with_interval_days(mut self, days: i64) -> Self {
        self.interval_days = days;
        self
    }

    /// A channel never collected is always due; otherwise it is due once
    /// the configured interval has fully elapsed.
    pub fn channel_due(&self, last_collected: Option<NaiveDate>, today: NaiveDate) -> bool {
        match last_collected {
            None => true,
            Some(last) => (today - last).num_days() >= self.interval_days,
        }
    }

    /// Immutable video fields (title, publish date) are fetched exactly
    /// once; comment re-fetching follows the configured mode.
    pub fn video_scope(&self, already_collected: bool) -> VideoFetchScope {
        if !already_collected {
            return VideoFetchScope::Full;
        }
        match self.comment_refresh {
            CommentRefresh::Always => VideoFetchScope::CommentsOnly,
            CommentRefresh::Never => VideoFetchScope::Skip,
        }
    }
}

/// Run-scoped configuration, resolved from the environment once at
/// startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub registry_path: PathBuf,
    pub refresh_interval_days: i64,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("YTSTATS_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./db/YouTubeStats.sqlite3")),
            registry_path: std::env::var("YTSTATS_CHANNELS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./channels.yaml")),
            refresh_interval_days: std::env::var("YTSTATS_REFRESH_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(365),
            scheduler_enabled: std::env::var("YTSTATS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("YTSTATS_REFRESH_CRON")
                .unwrap_or_else(|_| "0 0 3 * * *".to_string()),
        }
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy::annual().with_interval_days(self.refresh_interval_days)
    }
}

/// The set of monitored channels, kept in a YAML file next to the
/// database.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRegistry {
    pub channels: Vec<MonitoredChannel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoredChannel {
    pub channel_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn load_channel_registry(path: impl AsRef<Path>) -> Result<ChannelRegistry> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Enabled registry channels whose stored `collected_date` makes them
/// due under the policy. Channels with no stored row are always due.
pub async fn due_channels(
    store: &Store,
    registry: &ChannelRegistry,
    policy: &RefreshPolicy,
    today: NaiveDate,
) -> Result<Vec<String>, StoreError> {
    let mut due = Vec::new();
    for monitored in registry.channels.iter().filter(|c| c.enabled) {
        let last = store.channel_collected_date(&monitored.channel_id).await?;
        if policy.channel_due(last, today) {
            due.push(monitored.channel_id.clone());
        }
    }
    Ok(due)
}

/// One collector dump: raw API payloads grouped by entity, exactly as
/// the platform returned them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBatch {
    #[serde(default)]
    pub channels: Vec<Value>,
    #[serde(default)]
    pub videos: Vec<Value>,
    #[serde(default)]
    pub comment_threads: Vec<Value>,
}

impl RawBatch {
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

pub struct SyncEngine {
    store: Store,
}

impl SyncEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Merges one raw batch into the store. Re-running the same batch is
    /// idempotent: rows update in place, nothing duplicates.
    pub async fn apply_batch(
        &self,
        batch: &RawBatch,
        collected_date: NaiveDate,
    ) -> Result<RunSummary, StoreError> {
        let mut summary = RunSummary::started(Uuid::new_v4(), Utc::now());

        let channels = normalize_channel_batch(&batch.channels, collected_date);
        self.log_rejects(&channels, summary.counts_for(Entity::Channel));
        for record in &channels.records {
            let result = self.store.upsert_channel(record).await;
            apply_outcome(result, summary.counts_for(Entity::Channel))?;
        }

        let videos = normalize_video_batch(&batch.videos, collected_date);
        self.log_rejects(&videos, summary.counts_for(Entity::Video));
        for record in &videos.records {
            let result = self.store.upsert_video(record).await;
            apply_outcome(result, summary.counts_for(Entity::Video))?;
        }

        let comments = normalize_comment_thread_batch(&batch.comment_threads, collected_date);
        self.log_rejects(&comments, summary.counts_for(Entity::Comment));
        self.apply_comments(comments.records, summary.counts_for(Entity::Comment))
            .await?;

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            channels = summary.channels.total(),
            videos = summary.videos.total(),
            comments = summary.comments.total(),
            "batch applied"
        );
        Ok(summary)
    }

    /// Comments go top-level first so that in-batch parents land before
    /// their replies; replies whose parent shows up later in the batch
    /// are queued and retried until a pass makes no progress.
    async fn apply_comments(
        &self,
        mut records: Vec<CommentRecord>,
        counts: &mut TableCounts,
    ) -> Result<(), StoreError> {
        records.sort_by_key(CommentRecord::is_reply);

        let mut pending = records;
        loop {
            let mut deferred = Vec::new();
            let mut progressed = false;

            for record in pending {
                match self.store.upsert_comment(&record).await {
                    Ok(UpsertOutcome::Inserted) => {
                        counts.inserted += 1;
                        progressed = true;
                    }
                    Ok(UpsertOutcome::Updated) => {
                        counts.updated += 1;
                        progressed = true;
                    }
                    Err(err) if err.is_foreign_key() => deferred.push(record),
                    Err(err) => return Err(err),
                }
            }

            if deferred.is_empty() {
                return Ok(());
            }
            if !progressed {
                for record in &deferred {
                    warn!(comment_id = %record.comment_id, "skipping comment: parent not in store");
                    counts.skipped += 1;
                }
                return Ok(());
            }
            pending = deferred;
        }
    }

    fn log_rejects<T>(&self, normalized: &Normalized<T>, counts: &mut TableCounts) {
        for reject in &normalized.rejects {
            warn!(%reject, "skipping malformed record");
            counts.failed += 1;
        }
    }
}

fn apply_outcome(
    result: Result<UpsertOutcome, StoreError>,
    counts: &mut TableCounts,
) -> Result<(), StoreError> {
    match result {
        Ok(UpsertOutcome::Inserted) => counts.inserted += 1,
        Ok(UpsertOutcome::Updated) => counts.updated += 1,
        Err(err) if err.is_foreign_key() => {
            warn!(%err, "skipping record");
            counts.skipped += 1;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

/// Opens the configured store, migrates it, and applies one batch file.
pub async fn ingest_batch_file(config: &SyncConfig, path: &Path) -> Result<RunSummary> {
    let batch = RawBatch::from_json_file(path).await?;
    let store = Store::open(&config.database_path)
        .await
        .with_context(|| format!("opening store {}", config.database_path.display()))?;
    store.migrate().await.context("migrating store")?;

    let engine = SyncEngine::new(store);
    let summary = engine
        .apply_batch(&batch, Utc::now().date_naive())
        .await
        .context("applying batch")?;
    Ok(summary)
}

pub async fn report_due_channels(config: &SyncConfig) -> Result<Vec<String>> {
    let store = Store::open(&config.database_path)
        .await
        .with_context(|| format!("opening store {}", config.database_path.display()))?;
    store.migrate().await.context("migrating store")?;
    let registry = load_channel_registry(&config.registry_path).await?;
    let due = due_channels(
        &store,
        &registry,
        &config.refresh_policy(),
        Utc::now().date_naive(),
    )
    .await?;
    info!(count = due.len(), "channels due for re-collection");
    Ok(due)
}

/// Optional cron job that periodically reports which channels are due,
/// so an operator (or wrapper script) can kick off collection.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let job = Job::new_async(config.refresh_cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            match report_due_channels(&config).await {
                Ok(due) if due.is_empty() => info!("no channels due for refresh"),
                Ok(due) => info!(?due, "channels due for refresh"),
                Err(err) => warn!("refresh check failed: {err:#}"),
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron {}", config.refresh_cron))?;
    sched.add(job).await.context("adding refresh job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(month: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, month, d).unwrap()
    }

    #[test]
    fn never_collected_channel_is_due() {
        let policy = RefreshPolicy::annual();
        assert!(policy.channel_due(None, day(3, 1)));
    }

    #[test]
    fn channel_inside_interval_is_not_due() {
        let policy = RefreshPolicy::annual();
        assert!(!policy.channel_due(Some(day(1, 1)), day(3, 1)));
    }

    #[test]
    fn channel_is_due_exactly_at_interval_boundary() {
        let policy = RefreshPolicy::annual().with_interval_days(30);
        let last = day(3, 1);
        assert!(!policy.channel_due(Some(last), day(3, 30)));
        assert!(policy.channel_due(Some(last), day(3, 31)));
    }

    #[test]
    fn video_scope_never_refetches_immutable_fields() {
        let policy = RefreshPolicy::annual();
        assert_eq!(policy.video_scope(false), VideoFetchScope::Full);
        assert_eq!(policy.video_scope(true), VideoFetchScope::CommentsOnly);

        let frozen = RefreshPolicy {
            comment_refresh: CommentRefresh::Never,
            ..policy
        };
        assert_eq!(frozen.video_scope(true), VideoFetchScope::Skip);
    }

    #[tokio::test]
    async fn registry_parses_with_enabled_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.yaml");
        let yaml = concat!(
            "channels:\n",
            "  - channel_id: UCone\n",
            "    label: first\n",
            "  - channel_id: UCtwo\n",
            "    enabled: false\n",
        );
        tokio::fs::write(&path, yaml).await.unwrap();

        let registry = load_channel_registry(&path).await.unwrap();
        assert_eq!(registry.channels.len(), 2);
        assert!(registry.channels[0].enabled);
        assert_eq!(registry.channels[0].label.as_deref(), Some("first"));
        assert!(!registry.channels[1].enabled);
    }

    #[tokio::test]
    async fn due_channels_joins_registry_against_store() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
            .upsert_channel(&ytstats_core::ChannelRecord {
                channel_id: "UCfresh".into(),
                channel_name: "Fresh".into(),
                subscriber_count: None,
                video_count: None,
                collected_date: day(2, 1),
            })
            .await
            .unwrap();

        let registry = ChannelRegistry {
            channels: vec![
                MonitoredChannel {
                    channel_id: "UCfresh".into(),
                    label: None,
                    enabled: true,
                },
                MonitoredChannel {
                    channel_id: "UCnew".into(),
                    label: None,
                    enabled: true,
                },
                MonitoredChannel {
                    channel_id: "UCoff".into(),
                    label: None,
                    enabled: false,
                },
            ],
        };

        let policy = RefreshPolicy::annual();
        let due = due_channels(&store, &registry, &policy, day(3, 1)).await.unwrap();
        assert_eq!(due, vec!["UCnew".to_string()]);
    }

    #[tokio::test]
    async fn batch_file_tolerates_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        tokio::fs::write(&path, r#"{ "channels": [] }"#).await.unwrap();

        let batch = RawBatch::from_json_file(&path).await.unwrap();
        assert!(batch.channels.is_empty());
        assert!(batch.videos.is_empty());
        assert!(batch.comment_threads.is_empty());
    }
}
