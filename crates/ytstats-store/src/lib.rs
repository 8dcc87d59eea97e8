//! SQLite-backed schema store and keyed upsert engine.
//!
//! Three tables (`channels`, `videos`, `comments`) keyed by the
//! platform's external identifiers, with `ON DELETE CASCADE` down the
//! channel -> video -> comment chain and the self-referential comment
//! parent link. Writes go through a single-connection pool, which is
//! the serialization point that keeps the at-most-one-row-per-id
//! guarantee even if callers fetch in parallel.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::info;
use ytstats_core::{ChannelRecord, CommentRecord, Entity, VideoRecord};

pub const CRATE_NAME: &str = "ytstats-store";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced parent row (channel for a video, video or parent
    /// comment for a comment) is not in the store. Skippable per record.
    #[error("foreign key violation: {entity} {record_id} references a missing parent")]
    ForeignKey { entity: Entity, record_id: String },
    /// Connection or IO level failure. Fatal to the current run;
    /// previously committed rows stay committed.
    #[error("store unavailable")]
    Unavailable(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_foreign_key(&self) -> bool {
        matches!(self, StoreError::ForeignKey { .. })
    }

    fn classify(err: sqlx::Error, entity: Entity, record_id: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation) {
                return StoreError::ForeignKey {
                    entity,
                    record_id: record_id.to_string(),
                };
            }
        }
        StoreError::Unavailable(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS channels (
    channel_id       TEXT PRIMARY KEY,
    channel_name     TEXT NOT NULL,
    subscriber_count INTEGER,
    video_count      INTEGER,
    collected_date   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS videos (
    video_id             TEXT PRIMARY KEY,
    channel_id           TEXT NOT NULL REFERENCES channels(channel_id) ON DELETE CASCADE,
    title                TEXT NOT NULL,
    audio_path           TEXT,
    transcript           TEXT,
    transcript_language  TEXT,
    view_count           INTEGER,
    like_count           INTEGER,
    comment_count        INTEGER,
    comments_enabled     INTEGER NOT NULL DEFAULT 1,
    published_at         TEXT NOT NULL,
    collected_date       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS comments (
    comment_id         TEXT PRIMARY KEY,
    video_id           TEXT NOT NULL REFERENCES videos(video_id) ON DELETE CASCADE,
    parent_comment_id  TEXT REFERENCES comments(comment_id) ON DELETE CASCADE,
    author_id          TEXT NOT NULL,
    author_name        TEXT NOT NULL,
    content            TEXT NOT NULL,
    like_count         INTEGER,
    published_at       TEXT NOT NULL,
    collected_date     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
CREATE INDEX IF NOT EXISTS idx_comments_video ON comments(video_id);
";

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the store at `path` with foreign key
    /// enforcement on and a single writer connection.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        Self::connect(options).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Unavailable)?
            .foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the schema if absent and applies in-place column
    /// additions older databases may be missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        self.ensure_transcript_language_column().await?;
        info!("store schema ready");
        Ok(())
    }

    // The transcript_language column postdates the first corpus files,
    // so existing databases may lack it.
    async fn ensure_transcript_language_column(&self) -> Result<(), StoreError> {
        let columns = sqlx::query("PRAGMA table_info(videos)")
            .fetch_all(&self.pool)
            .await?;
        let present = columns.iter().any(|row| {
            row.try_get::<String, _>("name")
                .map(|name| name == "transcript_language")
                .unwrap_or(false)
        });
        if !present {
            info!("adding transcript_language column to videos");
            sqlx::query("ALTER TABLE videos ADD COLUMN transcript_language TEXT")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn upsert_channel(&self, record: &ChannelRecord) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.outcome_for(Entity::Channel, &record.channel_id).await?;
        sqlx::query(
            "INSERT INTO channels (channel_id, channel_name, subscriber_count, video_count, collected_date) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(channel_id) DO UPDATE SET \
                 channel_name = excluded.channel_name, \
                 subscriber_count = COALESCE(excluded.subscriber_count, subscriber_count), \
                 video_count = COALESCE(excluded.video_count, video_count), \
                 collected_date = excluded.collected_date",
        )
        .bind(&record.channel_id)
        .bind(&record.channel_name)
        .bind(record.subscriber_count)
        .bind(record.video_count)
        .bind(record.collected_date)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::classify(e, Entity::Channel, &record.channel_id))?;
        Ok(outcome)
    }

    /// Upserts a video. `published_at` and `channel_id` are written once
    /// and never rewritten; nullable fields only move null -> value.
    pub async fn upsert_video(&self, record: &VideoRecord) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.outcome_for(Entity::Video, &record.video_id).await?;
        sqlx::query(
            "INSERT INTO videos (video_id, channel_id, title, audio_path, transcript, \
                                 transcript_language, view_count, like_count, comment_count, \
                                 comments_enabled, published_at, collected_date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(video_id) DO UPDATE SET \
                 title = excluded.title, \
                 audio_path = COALESCE(excluded.audio_path, audio_path), \
                 transcript = COALESCE(excluded.transcript, transcript), \
                 transcript_language = COALESCE(excluded.transcript_language, transcript_language), \
                 view_count = COALESCE(excluded.view_count, view_count), \
                 like_count = COALESCE(excluded.like_count, like_count), \
                 comment_count = COALESCE(excluded.comment_count, comment_count), \
                 comments_enabled = excluded.comments_enabled, \
                 collected_date = excluded.collected_date",
        )
        .bind(&record.video_id)
        .bind(&record.channel_id)
        .bind(&record.title)
        .bind(record.audio_path.as_deref())
        .bind(record.transcript.as_deref())
        .bind(record.transcript_language.as_deref())
        .bind(record.view_count)
        .bind(record.like_count)
        .bind(record.comment_count)
        .bind(record.comments_enabled)
        .bind(record.published_at)
        .bind(record.collected_date)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::classify(e, Entity::Video, &record.video_id))?;
        Ok(outcome)
    }

    /// Upserts a comment. A non-null parent must already exist as a
    /// comment on the same video; the FK alone cannot enforce the
    /// same-video half, so it is checked here before the write.
    pub async fn upsert_comment(&self, record: &CommentRecord) -> Result<UpsertOutcome, StoreError> {
        if let Some(parent_id) = &record.parent_comment_id {
            let parent_video: Option<String> =
                sqlx::query_scalar("SELECT video_id FROM comments WHERE comment_id = ?1")
                    .bind(parent_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if parent_video.as_deref() != Some(record.video_id.as_str()) {
                return Err(StoreError::ForeignKey {
                    entity: Entity::Comment,
                    record_id: record.comment_id.clone(),
                });
            }
        }

        let outcome = self.outcome_for(Entity::Comment, &record.comment_id).await?;
        sqlx::query(
            "INSERT INTO comments (comment_id, video_id, parent_comment_id, author_id, \
                                   author_name, content, like_count, published_at, collected_date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(comment_id) DO UPDATE SET \
                 content = excluded.content, \
                 like_count = COALESCE(excluded.like_count, like_count), \
                 collected_date = excluded.collected_date",
        )
        .bind(&record.comment_id)
        .bind(&record.video_id)
        .bind(record.parent_comment_id.as_deref())
        .bind(&record.author_id)
        .bind(&record.author_name)
        .bind(&record.content)
        .bind(record.like_count)
        .bind(record.published_at)
        .bind(record.collected_date)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::classify(e, Entity::Comment, &record.comment_id))?;
        Ok(outcome)
    }

    async fn outcome_for(&self, entity: Entity, id: &str) -> Result<UpsertOutcome, StoreError> {
        let sql = match entity {
            Entity::Channel => "SELECT EXISTS(SELECT 1 FROM channels WHERE channel_id = ?1)",
            Entity::Video => "SELECT EXISTS(SELECT 1 FROM videos WHERE video_id = ?1)",
            Entity::Comment => "SELECT EXISTS(SELECT 1 FROM comments WHERE comment_id = ?1)",
        };
        let exists: bool = sqlx::query_scalar(sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(if exists {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    /// Cascade-deletes a channel with all its videos and their comments.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM channels WHERE channel_id = ?1")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn channel_collected_date(
        &self,
        channel_id: &str,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let date = sqlx::query_scalar("SELECT collected_date FROM channels WHERE channel_id = ?1")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(date)
    }

    /// All stored video ids, loaded once up front so the collector can
    /// skip known videos without a query per id.
    pub async fn existing_video_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT video_id FROM videos")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn row_count(&self, entity: Entity) -> Result<i64, StoreError> {
        let sql = match entity {
            Entity::Channel => "SELECT COUNT(*) FROM channels",
            Entity::Video => "SELECT COUNT(*) FROM videos",
            Entity::Comment => "SELECT COUNT(*) FROM comments",
        };
        let count: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM channels WHERE channel_id = ?1")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(channel_from_row).transpose()
    }

    pub async fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM videos WHERE video_id = ?1")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(video_from_row).transpose()
    }

    pub async fn get_comment(&self, comment_id: &str) -> Result<Option<CommentRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM comments WHERE comment_id = ?1")
            .bind(comment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(comment_from_row).transpose()
    }
}

fn channel_from_row(row: SqliteRow) -> Result<ChannelRecord, StoreError> {
    Ok(ChannelRecord {
        channel_id: row.try_get("channel_id")?,
        channel_name: row.try_get("channel_name")?,
        subscriber_count: row.try_get("subscriber_count")?,
        video_count: row.try_get("video_count")?,
        collected_date: row.try_get("collected_date")?,
    })
}

fn video_from_row(row: SqliteRow) -> Result<VideoRecord, StoreError> {
    Ok(VideoRecord {
        video_id: row.try_get("video_id")?,
        channel_id: row.try_get("channel_id")?,
        title: row.try_get("title")?,
        audio_path: row.try_get("audio_path")?,
        transcript: row.try_get("transcript")?,
        transcript_language: row.try_get("transcript_language")?,
        view_count: row.try_get("view_count")?,
        like_count: row.try_get("like_count")?,
        comment_count: row.try_get("comment_count")?,
        comments_enabled: row.try_get("comments_enabled")?,
        published_at: row.try_get("published_at")?,
        collected_date: row.try_get("collected_date")?,
    })
}

fn comment_from_row(row: SqliteRow) -> Result<CommentRecord, StoreError> {
    Ok(CommentRecord {
        comment_id: row.try_get("comment_id")?,
        video_id: row.try_get("video_id")?,
        parent_comment_id: row.try_get("parent_comment_id")?,
        author_id: row.try_get("author_id")?,
        author_name: row.try_get("author_name")?,
        content: row.try_get("content")?,
        like_count: row.try_get("like_count")?,
        published_at: row.try_get("published_at")?,
        collected_date: row.try_get("collected_date")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    async fn store() -> Store {
        let store = Store::open_in_memory().await.expect("open in-memory store");
        store.migrate().await.expect("migrate");
        store
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn channel(id: &str, subs: Option<i64>, collected: NaiveDate) -> ChannelRecord {
        ChannelRecord {
            channel_id: id.into(),
            channel_name: "Test".into(),
            subscriber_count: subs,
            video_count: Some(12),
            collected_date: collected,
        }
    }

    fn video(id: &str, channel_id: &str, collected: NaiveDate) -> VideoRecord {
        VideoRecord {
            video_id: id.into(),
            channel_id: channel_id.into(),
            title: "Hello".into(),
            audio_path: None,
            transcript: None,
            transcript_language: None,
            view_count: Some(10),
            like_count: Some(2),
            comment_count: Some(2),
            comments_enabled: true,
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().unwrap(),
            collected_date: collected,
        }
    }

    fn comment(id: &str, video_id: &str, parent: Option<&str>, collected: NaiveDate) -> CommentRecord {
        CommentRecord {
            comment_id: id.into(),
            video_id: video_id.into(),
            parent_comment_id: parent.map(str::to_string),
            author_id: "UC-author".into(),
            author_name: "author".into(),
            content: "text".into(),
            like_count: Some(1),
            published_at: Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).single().unwrap(),
            collected_date: collected,
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = store().await;
        store.migrate().await.expect("second migrate");
    }

    #[tokio::test]
    async fn rerun_updates_in_place_without_duplicating() {
        let store = store().await;
        let first = store
            .upsert_channel(&channel("C1", Some(100), day(1)))
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);

        let second = store
            .upsert_channel(&channel("C1", Some(150), day(2)))
            .await
            .unwrap();
        assert_eq!(second, UpsertOutcome::Updated);

        assert_eq!(store.row_count(Entity::Channel).await.unwrap(), 1);
        let row = store.get_channel("C1").await.unwrap().unwrap();
        assert_eq!(row.subscriber_count, Some(150));
        assert_eq!(row.collected_date, day(2));
    }

    #[tokio::test]
    async fn null_fields_do_not_clobber_stored_values() {
        let store = store().await;
        store.upsert_channel(&channel("C1", Some(100), day(1))).await.unwrap();

        let mut v = video("V1", "C1", day(1));
        v.transcript = Some("hello transcript".into());
        v.transcript_language = Some("en".into());
        store.upsert_video(&v).await.unwrap();

        // Re-collection without a transcript must keep the stored one.
        let mut refetched = video("V1", "C1", day(3));
        refetched.view_count = Some(25);
        refetched.like_count = None;
        store.upsert_video(&refetched).await.unwrap();

        let row = store.get_video("V1").await.unwrap().unwrap();
        assert_eq!(row.transcript.as_deref(), Some("hello transcript"));
        assert_eq!(row.transcript_language.as_deref(), Some("en"));
        assert_eq!(row.view_count, Some(25));
        assert_eq!(row.like_count, Some(2));
        assert_eq!(row.collected_date, day(3));
    }

    #[tokio::test]
    async fn published_at_is_never_rewritten() {
        let store = store().await;
        store.upsert_channel(&channel("C1", None, day(1))).await.unwrap();
        store.upsert_video(&video("V1", "C1", day(1))).await.unwrap();

        let mut drifted = video("V1", "C1", day(2));
        drifted.published_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap();
        store.upsert_video(&drifted).await.unwrap();

        let row = store.get_video("V1").await.unwrap().unwrap();
        assert_eq!(
            row.published_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().unwrap()
        );
    }

    #[tokio::test]
    async fn video_without_channel_is_a_foreign_key_violation() {
        let store = store().await;
        let err = store.upsert_video(&video("V1", "nope", day(1))).await.unwrap_err();
        assert!(err.is_foreign_key());
        assert_eq!(store.row_count(Entity::Video).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reply_with_missing_parent_writes_no_rows() {
        let store = store().await;
        store.upsert_channel(&channel("C1", None, day(1))).await.unwrap();
        store.upsert_video(&video("V1", "C1", day(1))).await.unwrap();

        let err = store
            .upsert_comment(&comment("CM2", "V1", Some("CM-ghost"), day(1)))
            .await
            .unwrap_err();
        assert!(err.is_foreign_key());
        assert_eq!(store.row_count(Entity::Comment).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reply_parent_must_be_on_the_same_video() {
        let store = store().await;
        store.upsert_channel(&channel("C1", None, day(1))).await.unwrap();
        store.upsert_video(&video("V1", "C1", day(1))).await.unwrap();
        store.upsert_video(&video("V2", "C1", day(1))).await.unwrap();
        store.upsert_comment(&comment("CM1", "V1", None, day(1))).await.unwrap();

        let err = store
            .upsert_comment(&comment("CM2", "V2", Some("CM1"), day(1)))
            .await
            .unwrap_err();
        assert!(err.is_foreign_key());
    }

    #[tokio::test]
    async fn deleting_a_channel_cascades_through_videos_and_comments() {
        let store = store().await;
        store.upsert_channel(&channel("C1", None, day(1))).await.unwrap();
        store.upsert_video(&video("V1", "C1", day(1))).await.unwrap();
        store.upsert_comment(&comment("CM1", "V1", None, day(1))).await.unwrap();
        store.upsert_comment(&comment("CM2", "V1", Some("CM1"), day(1))).await.unwrap();

        assert!(store.delete_channel("C1").await.unwrap());
        assert_eq!(store.row_count(Entity::Channel).await.unwrap(), 0);
        assert_eq!(store.row_count(Entity::Video).await.unwrap(), 0);
        assert_eq!(store.row_count(Entity::Comment).await.unwrap(), 0);

        assert!(!store.delete_channel("C1").await.unwrap());
    }

    #[tokio::test]
    async fn collected_date_lookup_and_video_id_set() {
        let store = store().await;
        assert_eq!(store.channel_collected_date("C1").await.unwrap(), None);

        store.upsert_channel(&channel("C1", None, day(4))).await.unwrap();
        store.upsert_video(&video("V1", "C1", day(4))).await.unwrap();
        store.upsert_video(&video("V2", "C1", day(4))).await.unwrap();

        assert_eq!(store.channel_collected_date("C1").await.unwrap(), Some(day(4)));
        let ids = store.existing_video_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("V1") && ids.contains("V2"));
    }

    #[tokio::test]
    async fn comment_content_updates_follow_latest_collection() {
        let store = store().await;
        store.upsert_channel(&channel("C1", None, day(1))).await.unwrap();
        store.upsert_video(&video("V1", "C1", day(1))).await.unwrap();
        store.upsert_comment(&comment("CM1", "V1", None, day(1))).await.unwrap();

        let mut edited = comment("CM1", "V1", None, day(5));
        edited.content = "edited text".into();
        edited.like_count = Some(9);
        let outcome = store.upsert_comment(&edited).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let row = store.get_comment("CM1").await.unwrap().unwrap();
        assert_eq!(row.content, "edited text");
        assert_eq!(row.like_count, Some(9));
        assert_eq!(row.collected_date, day(5));
        assert_eq!(store.row_count(Entity::Comment).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.sqlite3");

        {
            let store = Store::open(&path).await.unwrap();
            store.migrate().await.unwrap();
            store.upsert_channel(&channel("C1", Some(7), day(1))).await.unwrap();
        }

        let reopened = Store::open(&path).await.unwrap();
        reopened.migrate().await.unwrap();
        let row = reopened.get_channel("C1").await.unwrap().unwrap();
        assert_eq!(row.subscriber_count, Some(7));
    }
}
