//! Sorted views and workspace-level helpers built on the [`Store`] contract.
//!
//! The store returns records in store-native order; everything here applies the
//! ordering a feature expects (by `order`, by parsed date) on top of it.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use log::debug;
use serde_json::Value;

use crate::engine::Collection;
use crate::records::{Chapter, DailyStats, PlotPoint, Scene, TimelineEvent, WritingSession};
use crate::sdk::Store;
use crate::{Error, Key, Result};

/// Collections covered by [`Store::search`].
pub const SEARCHABLE: [Collection; 6] = [
    Collection::Chapters,
    Collection::Scenes,
    Collection::Characters,
    Collection::PlotPoints,
    Collection::Research,
    Collection::Timeline,
];

const SNIPPET_BEFORE: usize = 30;
const SNIPPET_AFTER: usize = 60;
const MAX_PERIOD_DAYS: i64 = 100 * 365;

/// One record matching a search, with the text around the first match.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub collection: Collection,
    pub key: Key,
    pub title: String,
    /// The field that matched.
    pub field: String,
    pub snippet: String,
}

/// Parses the free-text date of a timeline event.
///
/// Accepts RFC 3339 timestamps, ISO dates with or without a time, a few
/// spelled-out forms (`March 5, 1850`, `5 March 1850`, `03/05/1850`) and bare
/// years (`1850`, `-44`). Anything else is `None`.
pub fn parse_story_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d.and_time(NaiveTime::MIN));
        }
    }
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if !digits.is_empty() && digits.len() <= 4 && digits.chars().all(|c| c.is_ascii_digit()) {
        let year: i32 = raw.parse().ok()?;
        return NaiveDate::from_ymd_opt(year, 1, 1).map(|d| d.and_time(NaiveTime::MIN));
    }
    None
}

/// Orders events by parsed date; events whose date cannot be parsed follow,
/// keeping their relative order.
pub fn sort_timeline(events: &mut [TimelineEvent]) {
    events.sort_by_cached_key(|e| match parse_story_date(&e.date) {
        Some(date) => (0, Some(date)),
        None => (1, None),
    });
}

/// Byte offset in `haystack` of the first case-insensitive occurrence of
/// `needle_lower`, which must already be lowercase.
fn find_case_insensitive(haystack: &str, needle_lower: &str) -> Option<usize> {
    let mut lower = String::with_capacity(haystack.len());
    let mut origin = Vec::with_capacity(haystack.len());
    for (i, c) in haystack.char_indices() {
        lower.extend(c.to_lowercase());
        origin.resize(lower.len(), i);
    }
    lower.find(needle_lower).map(|pos| origin[pos])
}

fn snippet(text: &str, at: usize, needle_chars: usize) -> String {
    let start = text[..at]
        .char_indices()
        .rev()
        .nth(SNIPPET_BEFORE - 1)
        .map_or(0, |(i, _)| i);
    let end = text[at..]
        .char_indices()
        .nth(needle_chars + SNIPPET_AFTER)
        .map_or(text.len(), |(i, _)| at + i);

    let mut out = String::new();
    if start > 0 {
        out.push('…');
    }
    out.push_str(text[start..end].trim());
    if end < text.len() {
        out.push('…');
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn record_title(collection: Collection, record: &Value, key: &Key) -> String {
    ["title", "name"]
        .iter()
        .find_map(|f| record.get(*f).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} {}", collection, key))
}

/// Finds the first matching string field of one record.
fn match_record(collection: Collection, record: &Value, needle_lower: &str) -> Option<SearchHit> {
    let key = collection.key_of(record)?;
    let fields = record.as_object()?;
    let needle_chars = needle_lower.chars().count();

    // title and name first so a hit there wins over body text
    let mut names: Vec<&String> = fields.keys().collect();
    names.sort_by_key(|n| !matches!(n.as_str(), "title" | "name"));

    names.into_iter().find_map(|name| {
        let text = fields.get(name)?.as_str()?;
        let at = find_case_insensitive(text, needle_lower)?;
        Some(SearchHit {
            collection,
            key: key.clone(),
            title: record_title(collection, record, &key),
            field: name.clone(),
            snippet: snippet(text, at, needle_chars),
        })
    })
}

impl Store {
    /// All chapters, by `order`.
    pub async fn chapters(&self) -> Result<Vec<Chapter>> {
        let mut chapters: Vec<Chapter> = self.get_all_generic().await?;
        chapters.sort_by_key(|c| c.order);
        Ok(chapters)
    }

    /// The scenes of one chapter, by `order`.
    pub async fn scenes_by_chapter(&self, chapter_id: i64) -> Result<Vec<Scene>> {
        let mut scenes: Vec<Scene> = self.get_all_by_index_generic("chapterId", chapter_id).await?;
        scenes.sort_by_key(|s| s.order);
        Ok(scenes)
    }

    /// All plot points, by `order`.
    pub async fn plot_points(&self) -> Result<Vec<PlotPoint>> {
        let mut points: Vec<PlotPoint> = self.get_all_generic().await?;
        points.sort_by_key(|p| p.order);
        Ok(points)
    }

    /// All timeline events, ordered as by [`sort_timeline`].
    pub async fn timeline_events(&self) -> Result<Vec<TimelineEvent>> {
        let mut events: Vec<TimelineEvent> = self.get_all_generic().await?;
        sort_timeline(&mut events);
        Ok(events)
    }

    /// Adds a chapter at the end of the manuscript.
    pub async fn add_chapter(&self, title: &str) -> Result<Chapter> {
        let order = self.get_all(Collection::Chapters).await?.len() as i64;
        self.add_generic(&Chapter::new(title, order)).await
    }

    /// Adds a scene at the end of an existing chapter.
    pub async fn add_scene(&self, chapter_id: i64, title: &str) -> Result<Scene> {
        if self.get(Collection::Chapters, &Key::Id(chapter_id)).await?.is_none() {
            return Err(Error::InvalidRecord(format!("chapter {} does not exist", chapter_id)));
        }
        let order = self
            .get_all_by_index(Collection::Scenes, "chapterId", &Value::from(chapter_id))
            .await?
            .len() as i64;
        self.add_generic(&Scene::new(chapter_id, title, order)).await
    }

    /// Deletes a chapter's scenes, then the chapter.
    ///
    /// Not atomic: an interruption can leave the chapter without some of its scenes.
    pub async fn delete_chapter_cascade(&self, chapter_id: i64) -> Result<usize> {
        let scenes = self
            .get_all_by_index(Collection::Scenes, "chapterId", &Value::from(chapter_id))
            .await?;
        let mut removed = 0;
        for scene in &scenes {
            if let Some(key) = Collection::Scenes.key_of(scene) {
                self.delete(Collection::Scenes, &key).await?;
                removed += 1;
            }
        }
        self.delete(Collection::Chapters, &Key::Id(chapter_id)).await?;
        debug!("Deleted chapter {} and {} scenes", chapter_id, removed);
        Ok(removed)
    }

    /// Folds a writing session into today's (UTC) stats record.
    pub async fn record_writing_session(&self, word_count: u64, duration_secs: u64) -> Result<DailyStats> {
        self.record_writing_session_at(Utc::now(), word_count, duration_secs).await
    }

    /// Read-modify-write of the stats record for the date of `at`.
    pub async fn record_writing_session_at(
        &self,
        at: DateTime<Utc>,
        word_count: u64,
        duration_secs: u64,
    ) -> Result<DailyStats> {
        let date = at.format("%Y-%m-%d").to_string();
        let mut day = self
            .get_generic::<DailyStats>(date.as_str())
            .await?
            .unwrap_or_else(|| DailyStats::empty(date));
        day.record(WritingSession {
            timestamp: at,
            word_count,
            duration: duration_secs,
        });
        self.update_generic(&day).await
    }

    /// Stats records from the last `days` days, oldest first.
    pub async fn stats_for_period(&self, days: i64) -> Result<Vec<DailyStats>> {
        self.stats_for_period_ending(Utc::now().date_naive(), days).await
    }

    /// Stats records dated from `end - days` through `end`, oldest first.
    pub async fn stats_for_period_ending(&self, end: NaiveDate, days: i64) -> Result<Vec<DailyStats>> {
        let start = end - Duration::days(days.clamp(0, MAX_PERIOD_DAYS));
        let mut stats: Vec<(NaiveDate, DailyStats)> = self
            .get_all_generic::<DailyStats>()
            .await?
            .into_iter()
            .filter_map(|s| {
                let date = NaiveDate::parse_from_str(&s.date, "%Y-%m-%d").ok()?;
                (start <= date && date <= end).then_some((date, s))
            })
            .collect();
        stats.sort_by_key(|(date, _)| *date);
        Ok(stats.into_iter().map(|(_, s)| s).collect())
    }

    /// Case-insensitive substring search over the text fields of the writing
    /// collections. Returns at most one hit per record.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for collection in SEARCHABLE {
            for record in self.get_all(collection).await? {
                if let Some(hit) = match_record(collection, &record, &needle) {
                    hits.push(hit);
                }
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryBlobStore;
    use crate::sdk::StoreConfig;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> Store {
        Store::degraded(StoreConfig::new("unused"), Arc::new(MemoryBlobStore::new()), "test").unwrap()
    }

    fn event(title: &str, date: &str) -> TimelineEvent {
        TimelineEvent {
            title: title.into(),
            date: date.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_story_date() {
        assert!(parse_story_date("2024-03-05").is_some());
        assert!(parse_story_date("2024-03-05T10:00:00.000Z").is_some());
        assert!(parse_story_date("March 5, 1850").is_some());
        assert_eq!(
            parse_story_date("1850"),
            NaiveDate::from_ymd_opt(1850, 1, 1).map(|d| d.and_time(NaiveTime::MIN))
        );
        assert!(parse_story_date("-44").is_some());
        assert!(parse_story_date("The Third Age").is_none());
        assert!(parse_story_date("").is_none());
    }

    #[test]
    fn test_sort_timeline_puts_literals_last() {
        let mut events = vec![
            event("Epilogue", "After the war"),
            event("Battle", "1815-06-18"),
            event("Prologue", "Long ago"),
            event("Birth", "1769"),
        ];
        sort_timeline(&mut events);
        let titles: Vec<&str> = events.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Birth", "Battle", "Epilogue", "Prologue"]);
    }

    #[test]
    fn test_find_case_insensitive() {
        assert_eq!(find_case_insensitive("The Dragon sleeps", "dragon"), Some(4));
        assert_eq!(find_case_insensitive("ÉCOLE du Nord", "nord"), Some(10));
        assert_eq!(find_case_insensitive("nothing here", "dragon"), None);
    }

    #[tokio::test]
    async fn test_ordered_views() {
        let store = store();
        let first = store.add_chapter("First").await.unwrap();
        let second = store.add_chapter("Second").await.unwrap();
        assert_eq!((first.order, second.order), (0, 1));

        store.update_generic(&Chapter { order: 5, ..first.clone() }).await.unwrap();
        let titles: Vec<String> = store.chapters().await.unwrap().into_iter().map(|c| c.title).collect();
        assert_eq!(titles, vec!["Second", "First"]);

        let chapter_id = second.id.unwrap();
        store.add_scene(chapter_id, "a").await.unwrap();
        let b = store.add_scene(chapter_id, "b").await.unwrap();
        assert_eq!(b.order, 1);
        store.update_generic(&Scene { order: -1, ..b }).await.unwrap();
        let scenes: Vec<String> = store
            .scenes_by_chapter(chapter_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.title)
            .collect();
        assert_eq!(scenes, vec!["b", "a"]);

        assert!(matches!(store.add_scene(987654, "orphan").await, Err(Error::InvalidRecord(_))));
    }

    #[tokio::test]
    async fn test_cascade_deletes_children_first() {
        let store = store();
        let keep = store.add_chapter("Keep").await.unwrap();
        let drop = store.add_chapter("Drop").await.unwrap();
        store.add_scene(keep.id.unwrap(), "kept scene").await.unwrap();
        store.add_scene(drop.id.unwrap(), "gone 1").await.unwrap();
        store.add_scene(drop.id.unwrap(), "gone 2").await.unwrap();

        assert_eq!(store.delete_chapter_cascade(drop.id.unwrap()).await.unwrap(), 2);
        assert_eq!(store.get_all(Collection::Scenes).await.unwrap().len(), 1);
        assert_eq!(store.chapters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_accumulate_per_day() {
        let store = store();
        let morning = DateTime::parse_from_rfc3339("2024-06-01T08:00:00Z").unwrap().with_timezone(&Utc);
        let evening = DateTime::parse_from_rfc3339("2024-06-01T21:30:00Z").unwrap().with_timezone(&Utc);
        let next_day = DateTime::parse_from_rfc3339("2024-06-02T09:00:00Z").unwrap().with_timezone(&Utc);

        store.record_writing_session_at(morning, 300, 1200).await.unwrap();
        let day = store.record_writing_session_at(evening, 450, 1800).await.unwrap();
        store.record_writing_session_at(next_day, 100, 600).await.unwrap();

        assert_eq!(day.date, "2024-06-01");
        assert_eq!(day.word_count, 750);
        assert_eq!(day.session_count, 2);
        assert_eq!(day.total_time, 3000);
        assert_eq!(store.get_all(Collection::Stats).await.unwrap().len(), 2);

        let end = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
        let period = store.stats_for_period_ending(end, 30).await.unwrap();
        let dates: Vec<&str> = period.iter().map(|s| s.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-06-01", "2024-06-02"]);

        let later = NaiveDate::from_ymd_opt(2024, 8, 1).unwrap();
        assert!(store.stats_for_period_ending(later, 30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search() {
        let store = store();
        store
            .add(Collection::Characters, json!({"name": "Captain Mira", "notes": "fears the sea"}))
            .await
            .unwrap();
        store
            .add(Collection::Research, json!({"title": "Ships", "content": "Three-masted barques crossed the SEA in 40 days."}))
            .await
            .unwrap();
        store.set_setting("seaTheme", "sea").await.unwrap();

        let hits = store.search("  Sea ").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.collection != Collection::Settings));
        let research = hits.iter().find(|h| h.collection == Collection::Research).unwrap();
        assert_eq!(research.title, "Ships");
        assert_eq!(research.field, "content");
        assert!(research.snippet.contains("SEA"));

        let by_name = store.search("mira").await.unwrap();
        assert_eq!(by_name[0].field, "name");
        assert!(store.search("   ").await.unwrap().is_empty());
    }
}
