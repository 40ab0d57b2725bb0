//! Export and import of the whole workspace as a single JSON document.
//!
//! The document has one top-level array per collection, named exactly as the
//! collections are, plus an ISO-8601 `exportDate`.

use std::collections::HashSet;

use chrono::{SecondsFormat, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::Collection;
use crate::{CollectionReader, CollectionWriter, Error, Result};

/// A full copy of every collection at one instant.
///
/// Collections absent from an incoming document are `None` and are left
/// untouched by an import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenes: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot_points: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_date: Option<String>,
}

impl Snapshot {
    /// Records of one collection, if the snapshot carries it.
    pub fn collection(&self, collection: Collection) -> Option<&Vec<Value>> {
        self.slot(collection).as_ref()
    }

    /// Sets the records of one collection.
    pub fn set_collection(&mut self, collection: Collection, records: Vec<Value>) {
        *self.slot_mut(collection) = Some(records);
    }

    fn slot(&self, collection: Collection) -> &Option<Vec<Value>> {
        match collection {
            Collection::Chapters => &self.chapters,
            Collection::Scenes => &self.scenes,
            Collection::Characters => &self.characters,
            Collection::PlotPoints => &self.plot_points,
            Collection::Goals => &self.goals,
            Collection::Research => &self.research,
            Collection::Timeline => &self.timeline,
            Collection::Settings => &self.settings,
            Collection::Stats => &self.stats,
        }
    }

    fn slot_mut(&mut self, collection: Collection) -> &mut Option<Vec<Value>> {
        match collection {
            Collection::Chapters => &mut self.chapters,
            Collection::Scenes => &mut self.scenes,
            Collection::Characters => &mut self.characters,
            Collection::PlotPoints => &mut self.plot_points,
            Collection::Goals => &mut self.goals,
            Collection::Research => &mut self.research,
            Collection::Timeline => &mut self.timeline,
            Collection::Settings => &mut self.settings,
            Collection::Stats => &mut self.stats,
        }
    }

    /// Validates and decodes an incoming document.
    ///
    /// A document is plausible when it is an object with at least one known
    /// collection key holding a non-empty array. Nothing is written here; an
    /// implausible document is rejected before any destructive step.
    pub fn from_value(value: Value) -> Result<Snapshot> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidSnapshot("document is not a JSON object".to_string()))?;

        let plausible = Collection::ALL.iter().any(|c| {
            object
                .get(c.name())
                .and_then(Value::as_array)
                .is_some_and(|records| !records.is_empty())
        });
        if !plausible {
            return Err(Error::InvalidSnapshot(
                "document contains no recognized collection with data".to_string(),
            ));
        }

        serde_json::from_value(value).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Parses and validates a document, as [`Snapshot::from_value`].
    pub fn from_json(raw: &str) -> Result<Snapshot> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        Snapshot::from_value(value)
    }

    /// Total number of records across all collections present.
    pub fn record_count(&self) -> usize {
        Collection::ALL
            .iter()
            .filter_map(|c| self.collection(*c))
            .map(Vec::len)
            .sum()
    }
}

/// Reads every collection from `reader` into a snapshot stamped with the current time.
pub async fn export_from<R: CollectionReader + ?Sized>(reader: &R) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    for collection in Collection::ALL {
        snapshot.set_collection(collection, reader.get_all(collection).await?);
    }
    snapshot.export_date = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    Ok(snapshot)
}

/// Replaces, collection by collection, the contents of `writer` with the
/// snapshot's. Collections absent from the snapshot are left alone.
///
/// There is no cross-collection atomicity: a failure part way leaves earlier
/// collections already replaced.
pub async fn import_into<W: CollectionWriter + ?Sized>(writer: &W, snapshot: &Snapshot) -> Result<()> {
    for collection in Collection::ALL {
        let mut seen = HashSet::new();
        for record in snapshot.collection(collection).into_iter().flatten() {
            if let Some(key) = collection.check_record(record)? {
                if !seen.insert(key.clone()) {
                    return Err(Error::InvalidSnapshot(format!(
                        "key {} appears more than once in {}",
                        key, collection
                    )));
                }
            }
        }
    }

    for collection in Collection::ALL {
        let Some(records) = snapshot.collection(collection) else {
            continue;
        };
        writer.clear(collection).await?;
        for record in records {
            writer.add(collection, record.clone()).await?;
        }
        info!("Imported {} records into {}", records.len(), collection);
    }
    Ok(())
}
