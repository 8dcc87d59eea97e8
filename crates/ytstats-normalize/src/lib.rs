//! Ingestion normalizer: raw YouTube Data API v3 payloads -> core records.
//!
//! Payloads arrive as opaque `serde_json::Value`s from the external API
//! client. Normalization is the single validated boundary: a missing
//! required field yields a [`ValidationError`] naming the entity, record
//! id, and field, and never aborts the rest of a batch. Optional fields
//! (counts, audio, transcript) normalize to `None`.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use ytstats_core::{ChannelRecord, CommentRecord, Entity, ValidationError, VideoRecord};

pub const CRATE_NAME: &str = "ytstats-normalize";

/// Result of normalizing a batch of payloads: the records that passed
/// plus a reject per payload (or per reply) that did not.
#[derive(Debug)]
pub struct Normalized<T> {
    pub records: Vec<T>,
    pub rejects: Vec<ValidationError>,
}

impl<T> Default for Normalized<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            rejects: Vec::new(),
        }
    }
}

impl<T> Normalized<T> {
    fn push(&mut self, result: Result<T, ValidationError>) {
        match result {
            Ok(record) => self.records.push(record),
            Err(reject) => self.rejects.push(reject),
        }
    }
}

pub fn normalize_channel(
    payload: &Value,
    collected_date: NaiveDate,
) -> Result<ChannelRecord, ValidationError> {
    let channel_id = required_str(payload, "/id", Entity::Channel, None)?;
    let channel_name = required_str(
        payload,
        "/snippet/title",
        Entity::Channel,
        Some(&channel_id),
    )?;

    Ok(ChannelRecord {
        subscriber_count: optional_count(payload, "/statistics/subscriberCount"),
        video_count: optional_count(payload, "/statistics/videoCount"),
        channel_id,
        channel_name,
        collected_date,
    })
}

pub fn normalize_video(
    payload: &Value,
    collected_date: NaiveDate,
) -> Result<VideoRecord, ValidationError> {
    let video_id = required_str(payload, "/id", Entity::Video, None)?;
    let channel_id = required_str(payload, "/snippet/channelId", Entity::Video, Some(&video_id))?;
    let title = required_str(payload, "/snippet/title", Entity::Video, Some(&video_id))?;
    let published_at =
        required_timestamp(payload, "/snippet/publishedAt", Entity::Video, Some(&video_id))?;

    // A video with comments disabled carries no commentCount at all.
    let comment_count = optional_count(payload, "/statistics/commentCount");

    Ok(VideoRecord {
        view_count: optional_count(payload, "/statistics/viewCount"),
        like_count: optional_count(payload, "/statistics/likeCount"),
        comments_enabled: comment_count.is_some(),
        comment_count,
        video_id,
        channel_id,
        title,
        audio_path: None,
        transcript: None,
        transcript_language: None,
        published_at,
        collected_date,
    })
}

/// Flattens one `commentThreads.list` item into comment records: the
/// top-level comment first, then its replies.
///
/// A reply's parent is taken from its own `snippet.parentId` when the
/// platform supplies one, falling back to the enclosing top-level
/// comment's id. Thread roots store a null parent. A malformed reply is
/// rejected individually; a malformed top-level comment rejects the
/// whole thread since its replies could not resolve a parent.
pub fn normalize_comment_thread(
    payload: &Value,
    collected_date: NaiveDate,
) -> Result<Normalized<CommentRecord>, ValidationError> {
    let top = payload
        .pointer("/snippet/topLevelComment")
        .ok_or_else(|| ValidationError::new(Entity::Comment, None, "snippet.topLevelComment"))?;

    let top_id = required_str(top, "/id", Entity::Comment, None)?;
    let video_id = match payload.pointer("/snippet/videoId").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => required_str(top, "/snippet/videoId", Entity::Comment, Some(&top_id))?,
    };

    let mut out = Normalized::default();
    out.records.push(normalize_comment_resource(
        top,
        &top_id,
        &video_id,
        None,
        collected_date,
    )?);

    let replies = payload
        .pointer("/replies/comments")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for reply in replies {
        let result = normalize_reply(reply, &top_id, &video_id, collected_date);
        out.push(result);
    }

    Ok(out)
}

fn normalize_reply(
    reply: &Value,
    top_id: &str,
    video_id: &str,
    collected_date: NaiveDate,
) -> Result<CommentRecord, ValidationError> {
    let reply_id = required_str(reply, "/id", Entity::Comment, None)?;
    let parent = reply
        .pointer("/snippet/parentId")
        .and_then(Value::as_str)
        .unwrap_or(top_id)
        .to_string();
    normalize_comment_resource(reply, &reply_id, video_id, Some(parent), collected_date)
}

fn normalize_comment_resource(
    resource: &Value,
    comment_id: &str,
    video_id: &str,
    parent_comment_id: Option<String>,
    collected_date: NaiveDate,
) -> Result<CommentRecord, ValidationError> {
    let author_id = required_str(
        resource,
        "/snippet/authorChannelId/value",
        Entity::Comment,
        Some(comment_id),
    )?;
    let author_name = required_str(
        resource,
        "/snippet/authorDisplayName",
        Entity::Comment,
        Some(comment_id),
    )?;
    let content = required_str(
        resource,
        "/snippet/textDisplay",
        Entity::Comment,
        Some(comment_id),
    )?;
    let published_at = required_timestamp(
        resource,
        "/snippet/publishedAt",
        Entity::Comment,
        Some(comment_id),
    )?;

    Ok(CommentRecord {
        comment_id: comment_id.to_string(),
        video_id: video_id.to_string(),
        parent_comment_id,
        author_id,
        author_name,
        content,
        like_count: optional_count(resource, "/snippet/likeCount"),
        published_at,
        collected_date,
    })
}

pub fn normalize_channel_batch(
    payloads: &[Value],
    collected_date: NaiveDate,
) -> Normalized<ChannelRecord> {
    let mut out = Normalized::default();
    for payload in payloads {
        out.push(normalize_channel(payload, collected_date));
    }
    out
}

pub fn normalize_video_batch(
    payloads: &[Value],
    collected_date: NaiveDate,
) -> Normalized<VideoRecord> {
    let mut out = Normalized::default();
    for payload in payloads {
        out.push(normalize_video(payload, collected_date));
    }
    out
}

pub fn normalize_comment_thread_batch(
    payloads: &[Value],
    collected_date: NaiveDate,
) -> Normalized<CommentRecord> {
    let mut out = Normalized::default();
    for payload in payloads {
        match normalize_comment_thread(payload, collected_date) {
            Ok(mut thread) => {
                out.records.append(&mut thread.records);
                out.rejects.append(&mut thread.rejects);
            }
            Err(reject) => out.rejects.push(reject),
        }
    }
    out
}

fn required_str(
    payload: &Value,
    pointer: &str,
    entity: Entity,
    record_id: Option<&str>,
) -> Result<String, ValidationError> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ValidationError::new(entity, record_id.map(str::to_string), field_name(pointer))
        })
}

fn required_timestamp(
    payload: &Value,
    pointer: &str,
    entity: Entity,
    record_id: Option<&str>,
) -> Result<DateTime<Utc>, ValidationError> {
    let raw = required_str(payload, pointer, entity, record_id)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::new(entity, record_id.map(str::to_string), field_name(pointer)))
}

/// Count fields arrive as JSON strings on some endpoints and as numbers
/// on others; accept both, treat anything else as absent.
fn optional_count(payload: &Value, pointer: &str) -> Option<i64> {
    match payload.pointer(pointer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_name(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}
