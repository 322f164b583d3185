//! Record snapshots.
//!
//! A [`Grid`] is the client-side view of a set of records, keyed by record id.
//! Records are tag dictionaries kept as JSON objects; decoding the wire format
//! into them belongs to the transport layer.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::Ids;

/// A single record: tag name to value.
pub type Record = Map<String, Value>;

/// Tag a poll result uses to report that a record left the watch.
pub const REMOVED_TAG: &str = "removed";

const ID_TAG: &str = "id";

/// Extracts the id of a record.
///
/// Accepts a plain string or a ref object such as
/// `{"_kind": "ref", "val": "site-1"}`.
pub fn record_id(record: &Record) -> Option<&str> {
    match record.get(ID_TAG)? {
        Value::String(id) => Some(id.as_str()),
        Value::Object(obj) => obj.get("val").and_then(Value::as_str),
        _ => None,
    }
}

/// Whether the server flagged this record as removed.
pub fn is_removed(record: &Record) -> bool {
    record.contains_key(REMOVED_TAG)
}

/// Snapshot of records keyed by id, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    #[serde(default)]
    meta: Record,
    #[serde(default)]
    rows: IndexMap<String, Record>,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a grid from rows; rows without an id are skipped and a later
    /// row with the same id replaces an earlier one.
    pub fn from_rows(rows: impl IntoIterator<Item = Record>) -> Self {
        let mut grid = Grid::new();
        for row in rows {
            grid.insert(row);
        }
        grid
    }

    pub fn with_meta(
        mut self,
        meta: Record,
    ) -> Self {
        self.meta = meta;
        self
    }

    pub fn meta(&self) -> &Record {
        &self.meta
    }

    /// Inserts or replaces a row. Returns `false` if the row has no id.
    pub fn insert(
        &mut self,
        row: Record,
    ) -> bool {
        match record_id(&row).map(str::to_string) {
            Some(id) => {
                self.rows.insert(id, row);
                true
            }
            None => false,
        }
    }

    pub fn remove(
        &mut self,
        id: &str,
    ) -> Option<Record> {
        self.rows.shift_remove(id)
    }

    pub fn get(
        &self,
        id: &str,
    ) -> Option<&Record> {
        self.rows.get(id)
    }

    pub fn contains(
        &self,
        id: &str,
    ) -> bool {
        self.rows.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn rows(&self) -> impl Iterator<Item = &Record> {
        self.rows.values()
    }

    pub fn ids(&self) -> Ids {
        self.rows.keys().cloned().collect()
    }

    /// Applies a change set: rows replace existing rows by id, rows flagged
    /// `removed` are dropped. Nothing else is touched.
    ///
    /// Returns the number of rows that changed.
    pub fn merge(
        &mut self,
        changed: &Grid,
    ) -> usize {
        let mut touched = 0;
        for (id, row) in &changed.rows {
            if is_removed(row) {
                if self.rows.shift_remove(id).is_some() {
                    touched += 1;
                }
            } else {
                self.rows.insert(id.clone(), row.clone());
                touched += 1;
            }
        }
        touched
    }

    /// Rows whose id is in `ids`, keeping this grid's order and meta.
    pub fn filtered(
        &self,
        ids: &Ids,
    ) -> Grid {
        Grid {
            meta: self.meta.clone(),
            rows: self
                .rows
                .iter()
                .filter(|(id, _)| ids.contains(id))
                .map(|(id, row)| (id.clone(), row.clone()))
                .collect(),
        }
    }

    /// Drops every row whose id is in `ids`.
    pub fn remove_ids(
        &mut self,
        ids: &Ids,
    ) {
        self.rows.retain(|id, _| !ids.contains(id));
    }

    /// Whether any row (including removal markers) concerns one of `ids`.
    pub fn touches(
        &self,
        ids: &Ids,
    ) -> bool {
        self.rows.keys().any(|id| ids.contains(id))
    }
}
