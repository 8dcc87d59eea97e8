//! Core domain records and error taxonomy for ytstats.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ytstats-core";

/// Discriminator for the three persisted entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Entity {
    Channel,
    Video,
    Comment,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Channel => f.write_str("channel"),
            Entity::Video => f.write_str("video"),
            Entity::Comment => f.write_str("comment"),
        }
    }
}

/// A monitored channel as observed at one collection pass.
///
/// `channel_id` is the platform-assigned identifier and the primary key;
/// it is never generated locally. `collected_date` records when *we*
/// fetched the row, distinct from any platform timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub channel_name: String,
    pub subscriber_count: Option<i64>,
    pub video_count: Option<i64>,
    pub collected_date: NaiveDate,
}

/// One video row. Audio path and transcript are attached by collaborator
/// services after normalization and stay `None` until then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    pub audio_path: Option<String>,
    pub transcript: Option<String>,
    pub transcript_language: Option<String>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub comments_enabled: bool,
    pub published_at: DateTime<Utc>,
    pub collected_date: NaiveDate,
}

impl VideoRecord {
    pub fn with_transcript(mut self, text: impl Into<String>, language: impl Into<String>) -> Self {
        self.transcript = Some(text.into());
        self.transcript_language = Some(language.into());
        self
    }

    pub fn with_audio_path(mut self, path: impl Into<String>) -> Self {
        self.audio_path = Some(path.into());
        self
    }
}

/// One comment row. Top-level comments and replies share a single id
/// space; `parent_comment_id` is `None` for thread roots and the parent
/// comment's id for replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub comment_id: String,
    pub video_id: String,
    pub parent_comment_id: Option<String>,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub like_count: Option<i64>,
    pub published_at: DateTime<Utc>,
    pub collected_date: NaiveDate,
}

impl CommentRecord {
    pub fn is_reply(&self) -> bool {
        self.parent_comment_id.is_some()
    }
}

/// A malformed or incomplete input record. Reported per record; a batch
/// containing one never fails as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{entity} payload {}: missing or invalid field `{field}`", record_id.as_deref().unwrap_or("<no id>"))]
pub struct ValidationError {
    pub entity: Entity,
    pub record_id: Option<String>,
    pub field: String,
}

impl ValidationError {
    pub fn new(entity: Entity, record_id: Option<String>, field: impl Into<String>) -> Self {
        Self {
            entity,
            record_id,
            field: field.into(),
        }
    }
}

/// Per-table outcome counters for a run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl TableCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.skipped + self.failed
    }
}

/// User-visible result of one ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels: TableCounts,
    pub videos: TableCounts,
    pub comments: TableCounts,
}

impl RunSummary {
    pub fn started(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            channels: TableCounts::default(),
            videos: TableCounts::default(),
            comments: TableCounts::default(),
        }
    }

    pub fn counts_for(&mut self, entity: Entity) -> &mut TableCounts {
        match entity {
            Entity::Channel => &mut self.channels,
            Entity::Video => &mut self.videos,
            Entity::Comment => &mut self.comments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reply_classification_follows_parent_link() {
        let base = CommentRecord {
            comment_id: "CM2".into(),
            video_id: "V1".into(),
            parent_comment_id: Some("CM1".into()),
            author_id: "U1".into(),
            author_name: "someone".into(),
            content: "hi".into(),
            like_count: None,
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            collected_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        };
        assert!(base.is_reply());

        let top_level = CommentRecord {
            parent_comment_id: None,
            ..base
        };
        assert!(!top_level.is_reply());
    }

    #[test]
    fn validation_error_names_the_offending_field() {
        let err = ValidationError::new(Entity::Video, Some("V9".into()), "snippet.title");
        assert_eq!(
            err.to_string(),
            "video payload V9: missing or invalid field `snippet.title`"
        );

        let anonymous = ValidationError::new(Entity::Channel, None, "id");
        assert!(anonymous.to_string().contains("<no id>"));
    }

    #[test]
    fn run_summary_counts_route_by_entity() {
        let mut summary = RunSummary::started(Uuid::new_v4(), Utc::now());
        summary.counts_for(Entity::Channel).inserted += 1;
        summary.counts_for(Entity::Comment).failed += 2;
        assert_eq!(summary.channels.inserted, 1);
        assert_eq!(summary.comments.failed, 2);
        assert_eq!(summary.comments.total(), 2);
        assert_eq!(summary.videos.total(), 0);
    }
}
