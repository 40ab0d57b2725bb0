use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::{Error, Key, Result};

/// The named collections of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Chapters,
    Scenes,
    Characters,
    PlotPoints,
    Goals,
    Research,
    Timeline,
    Settings,
    Stats,
}

impl Collection {
    /// Every collection, in export order.
    pub const ALL: [Collection; 9] = [
        Collection::Chapters,
        Collection::Scenes,
        Collection::Characters,
        Collection::PlotPoints,
        Collection::Goals,
        Collection::Research,
        Collection::Timeline,
        Collection::Settings,
        Collection::Stats,
    ];

    /// Wire name, also used as table name and snapshot key.
    pub fn name(self) -> &'static str {
        match self {
            Collection::Chapters => "chapters",
            Collection::Scenes => "scenes",
            Collection::Characters => "characters",
            Collection::PlotPoints => "plotPoints",
            Collection::Goals => "goals",
            Collection::Research => "research",
            Collection::Timeline => "timeline",
            Collection::Settings => "settings",
            Collection::Stats => "stats",
        }
    }

    /// Field holding the record's primary key.
    pub fn key_path(self) -> &'static str {
        match self {
            Collection::Settings => "key",
            Collection::Stats => "date",
            _ => "id",
        }
    }

    /// Whether the store generates the key on insert.
    pub fn auto_increment(self) -> bool {
        !matches!(self, Collection::Settings | Collection::Stats)
    }

    /// Secondary indexes declared for the collection. All are non-unique except
    /// `stats.date`, which is the primary key itself.
    pub fn indexes(self) -> &'static [&'static str] {
        match self {
            Collection::Chapters | Collection::PlotPoints => &["order"],
            Collection::Scenes => &["chapterId", "order"],
            Collection::Timeline | Collection::Stats => &["date"],
            _ => &[],
        }
    }

    /// Whether `index` is one of [`Collection::indexes`].
    pub fn has_index(self, index: &str) -> bool {
        self.indexes().contains(&index)
    }

    pub(crate) fn check_index(self, index: &str) -> Result<()> {
        if self.has_index(index) {
            Ok(())
        } else {
            Err(Error::UnknownIndex {
                collection: self.name().to_string(),
                index: index.to_string(),
            })
        }
    }

    /// Extracts the key of a record, if it carries a usable one.
    pub fn key_of(self, record: &Value) -> Option<Key> {
        let key = Key::from_json(record.get(self.key_path())?)?;
        match (self.auto_increment(), &key) {
            (true, Key::Id(_)) | (false, Key::Name(_)) => Some(key),
            _ => None,
        }
    }

    /// Checks that a record is an object and, for explicitly keyed collections,
    /// that it carries its key.
    pub(crate) fn check_record(self, record: &Value) -> Result<Option<Key>> {
        if !record.is_object() {
            return Err(Error::InvalidRecord(format!(
                "{} records must be JSON objects",
                self.name()
            )));
        }
        let key = self.key_of(record);
        if key.is_none() {
            match record.get(self.key_path()) {
                Some(v) if !v.is_null() => {
                    return Err(Error::InvalidRecord(format!(
                        "{} key {} has the wrong type",
                        self.name(),
                        v
                    )));
                }
                _ if !self.auto_increment() => {
                    return Err(Error::MissingKey {
                        collection: self.name().to_string(),
                        field: self.key_path().to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(key)
    }

    /// Rejects a key of the wrong kind: integer ids for auto-keyed
    /// collections, strings for `settings` and `stats`.
    pub fn check_key(self, key: &Key) -> Result<()> {
        match (self.auto_increment(), key) {
            (true, Key::Id(_)) | (false, Key::Name(_)) => Ok(()),
            _ => Err(Error::InvalidRecord(format!(
                "{} is not a valid {} key for {}",
                key,
                if self.auto_increment() { "integer" } else { "string" },
                self.name()
            ))),
        }
    }

    /// Builds a key of this collection's kind from user text.
    pub fn parse_key(self, raw: &str) -> Result<Key> {
        if !self.auto_increment() {
            return Ok(Key::from(raw));
        }
        raw.trim()
            .parse::<i64>()
            .map(Key::Id)
            .map_err(|_| Error::InvalidRecord(format!("{:?} is not a valid id for {}", raw, self.name())))
    }

    pub(crate) fn duplicate(self, key: &Key) -> Error {
        Error::DuplicateKey {
            collection: self.name().to_string(),
            key: key.to_string(),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| Error::UnknownCollection(s.to_string()))
    }
}
