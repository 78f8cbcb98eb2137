//! Merging per-file records into the persisted result set.
//!
//! On disk the result set is a JSON object: either group key → filename → record, or
//! (flat mode) filename → record, with a `settings` entry that is always written last.
//! The shape is decided once when the file is read, never by trial and error later on.

use crate::core::orchestrator::CoregisteredFile;
use crate::types::{CoregError, CoregResult, CoregistrationRecord};
use indexmap::IndexMap;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Reserved top-level key holding the run configuration
pub const SETTINGS_KEY: &str = "settings";

pub type FileRecords = IndexMap<String, CoregistrationRecord>;

#[derive(Debug, Clone, PartialEq)]
pub enum ResultLayout {
    /// group key (satellite) → filename → record
    Grouped(IndexMap<String, FileRecords>),
    /// filename → record, for sessions without satellite groups
    Flat(FileRecords),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub layout: ResultLayout,
    pub settings: Value,
}

/// Build a grouped result set; within a group later records for a filename win
pub fn aggregate<I, G>(records_by_group: I, settings: Value) -> ResultSet
where
    I: IntoIterator<Item = (G, Vec<CoregisteredFile>)>,
    G: Into<String>,
{
    let mut set = ResultSet::grouped(settings);
    for (group, files) in records_by_group {
        set.insert_group(group, files);
    }
    set
}

/// Build a flat result set; later records for a filename win
pub fn aggregate_flat(files: Vec<CoregisteredFile>, settings: Value) -> ResultSet {
    ResultSet {
        layout: ResultLayout::Flat(merge(IndexMap::new(), files)),
        settings,
    }
}

fn merge(mut records: FileRecords, files: Vec<CoregisteredFile>) -> FileRecords {
    for file in files {
        if records.contains_key(&file.filename) {
            log::debug!("Overwriting earlier record for {}", file.filename);
        }
        records.insert(file.filename, file.record);
    }
    records
}

impl ResultSet {
    pub fn grouped(settings: Value) -> Self {
        Self {
            layout: ResultLayout::Grouped(IndexMap::new()),
            settings,
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self.layout, ResultLayout::Flat(_))
    }

    /// Merge `files` into `group`, creating it if needed.
    ///
    /// On a flat set the group key is ignored and the files are merged at top level.
    pub fn insert_group(&mut self, group: impl Into<String>, files: Vec<CoregisteredFile>) {
        match &mut self.layout {
            ResultLayout::Grouped(groups) => {
                let records = groups.entry(group.into()).or_default();
                let existing = std::mem::take(records);
                *records = merge(existing, files);
            }
            ResultLayout::Flat(records) => {
                let existing = std::mem::take(records);
                *records = merge(existing, files);
            }
        }
    }

    /// Group keys in insertion order; empty for a flat set
    pub fn group_names(&self) -> Vec<&str> {
        match &self.layout {
            ResultLayout::Grouped(groups) => groups.keys().map(String::as_str).collect(),
            ResultLayout::Flat(_) => Vec::new(),
        }
    }

    /// Every record as `(group, filename, record)` in stored order
    pub fn records(&self) -> Vec<(Option<&str>, &str, &CoregistrationRecord)> {
        match &self.layout {
            ResultLayout::Grouped(groups) => groups
                .iter()
                .flat_map(|(group, files)| {
                    files
                        .iter()
                        .map(move |(name, record)| (Some(group.as_str()), name.as_str(), record))
                })
                .collect(),
            ResultLayout::Flat(files) => files
                .iter()
                .map(|(name, record)| (None, name.as_str(), record))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.layout {
            ResultLayout::Grouped(groups) => groups.values().map(IndexMap::len).sum(),
            ResultLayout::Flat(files) => files.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decide the layout from the top-level object and parse its records
    pub fn from_entries(mut entries: IndexMap<String, Value>) -> CoregResult<Self> {
        let settings = entries.shift_remove(SETTINGS_KEY).unwrap_or(Value::Null);

        let groups = entries.values().filter(|v| is_group(v)).count();
        let layout = if groups == entries.len() {
            let mut parsed = IndexMap::new();
            for (group, files) in entries {
                parsed.insert(group, serde_json::from_value::<FileRecords>(files)?);
            }
            ResultLayout::Grouped(parsed)
        } else if groups == 0 {
            let mut parsed = IndexMap::new();
            for (filename, record) in entries {
                if !record.is_object() {
                    return Err(CoregError::InvalidFormat(format!(
                        "entry '{}' is not a coregistration record",
                        filename
                    )));
                }
                parsed.insert(filename, serde_json::from_value(record)?);
            }
            ResultLayout::Flat(parsed)
        } else {
            return Err(CoregError::InvalidFormat(
                "result file mixes satellite groups and per-file records".to_string(),
            ));
        };

        Ok(Self { layout, settings })
    }
}

/// A group is an object whose members are all objects (records)
fn is_group(value: &Value) -> bool {
    value
        .as_object()
        .map(|members| members.values().all(Value::is_object))
        .unwrap_or(false)
}

impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match &self.layout {
            ResultLayout::Grouped(groups) => {
                for (group, files) in groups {
                    map.serialize_entry(group, files)?;
                }
            }
            ResultLayout::Flat(files) => {
                for (filename, record) in files {
                    map.serialize_entry(filename, record)?;
                }
            }
        }
        map.serialize_entry(SETTINGS_KEY, &self.settings)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResultSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = IndexMap::<String, Value>::deserialize(deserializer)?;
        ResultSet::from_entries(entries).map_err(D::Error::custom)
    }
}
