//! Typed records, one per collection.
//!
//! Field names follow the stored camelCase layout, so a record written by one
//! version of the workspace reads back unchanged in another. Optional fields are
//! omitted from the stored document when absent.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};

use crate::engine::Collection;

/// A type stored in one of the named collections.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Chapter {
    /// A new empty chapter stamped with the current time.
    pub fn new(title: impl Into<String>, order: i64) -> Self {
        let now = Utc::now();
        Self {
            title: title.into(),
            content: Some(String::new()),
            order,
            created_at: Some(now),
            last_modified: Some(now),
            ..Default::default()
        }
    }
}

impl Record for Chapter {
    const COLLECTION: Collection = Collection::Chapters;
}

/// A scene belongs to exactly one chapter through `chapter_id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub chapter_id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Scene {
    /// A new empty scene of `chapter_id` stamped with the current time.
    pub fn new(chapter_id: i64, title: impl Into<String>, order: i64) -> Self {
        let now = Utc::now();
        Self {
            chapter_id,
            title: title.into(),
            content: Some(String::new()),
            order,
            created_at: Some(now),
            last_modified: Some(now),
            ..Default::default()
        }
    }
}

impl Record for Scene {
    const COLLECTION: Collection = Collection::Scenes;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appearance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Record for Character {
    const COLLECTION: Collection = Collection::Characters;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlotPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    /// Structural role, e.g. `inciting-incident`, `midpoint`, `climax`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Character names, free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Record for PlotPoint {
    const COLLECTION: Collection = Collection::PlotPoints;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    /// `words`, `pages`, `chapters`, `scenes`, `time` or `days`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, serialize_with = "serialize_amount")]
    pub target: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Writes whole amounts as JSON integers so `5000` does not come back as `5000.0`.
fn serialize_amount<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() < EXACT {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

impl Record for Goal {
    const COLLECTION: Collection = Collection::Goals;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchNote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub content: String,
    /// Comma-separated tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Record for ResearchNote {
    const COLLECTION: Collection = Collection::Research;
}

/// An in-story event. `date` is free text and may not be a calendar date.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Record for TimelineEvent {
    const COLLECTION: Collection = Collection::Timeline;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: serde_json::Value,
}

impl Record for Setting {
    const COLLECTION: Collection = Collection::Settings;
}

/// Writing activity for one calendar day, keyed by `date` (`YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub date: String,
    #[serde(default)]
    pub word_count: u64,
    #[serde(default)]
    pub session_count: u64,
    /// Seconds spent writing.
    #[serde(default)]
    pub total_time: u64,
    #[serde(default)]
    pub sessions: Vec<WritingSession>,
}

impl DailyStats {
    /// A day with no sessions yet.
    pub fn empty(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            ..Default::default()
        }
    }

    /// Folds one session into the day's totals.
    pub fn record(&mut self, session: WritingSession) {
        self.word_count += session.word_count;
        self.session_count += 1;
        self.total_time += session.duration;
        self.sessions.push(session);
    }
}

impl Record for DailyStats {
    const COLLECTION: Collection = Collection::Stats;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritingSession {
    pub timestamp: DateTime<Utc>,
    pub word_count: u64,
    /// Seconds.
    pub duration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_are_camel_case() {
        let scene = Scene {
            id: Some(4),
            chapter_id: 2,
            title: "Arrival".into(),
            order: 1,
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&scene).unwrap(),
            json!({"id": 4, "chapterId": 2, "title": "Arrival", "order": 1})
        );

        let point: PlotPoint = serde_json::from_value(json!({"title": "Turn", "type": "midpoint"})).unwrap();
        assert_eq!(point.kind.as_deref(), Some("midpoint"));
        assert_eq!(point.order, 0);
    }

    #[test]
    fn test_reads_browser_timestamps() {
        let chapter: Chapter = serde_json::from_value(json!({
            "id": 1,
            "title": "One",
            "order": 0,
            "createdAt": "2024-02-03T10:11:12.345Z"
        }))
        .unwrap();
        assert!(chapter.created_at.is_some());
    }

    #[test]
    fn test_daily_stats_record() {
        let mut day = DailyStats::empty("2024-05-06");
        for words in [120, 80] {
            day.record(WritingSession {
                timestamp: Utc::now(),
                word_count: words,
                duration: 600,
            });
        }
        assert_eq!(day.word_count, 200);
        assert_eq!(day.session_count, 2);
        assert_eq!(day.total_time, 1200);
        assert_eq!(day.sessions.len(), 2);
    }

    #[test]
    fn test_whole_targets_stay_integers() {
        let goal: Goal = serde_json::from_value(json!({"title": "Draft", "target": 5000})).unwrap();
        assert_eq!(serde_json::to_value(&goal).unwrap()["target"], json!(5000));

        let goal = Goal {
            title: "Hours".into(),
            target: 2.5,
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&goal).unwrap()["target"], json!(2.5));
    }

    #[test]
    fn test_missing_link_fields_default() {
        let scene: Scene = serde_json::from_value(json!({"id": 1, "title": "Loose"})).unwrap();
        assert_eq!(scene.chapter_id, 0);
        let event: TimelineEvent = serde_json::from_value(json!({"id": 2, "title": "Undated"})).unwrap();
        assert_eq!(event.date, "");
    }
}
