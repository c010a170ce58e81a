// ========================================
// model.rs - Capture data types
// ========================================
// Entries, bindings, filters and pages shared by the write, read and
// administration sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::CaptureError;

/// Open-schema snapshot of a row: column name -> value, in column order.
pub type RowDocument = serde_json::Map<String, Value>;

/// Actor recorded for mutations made outside a capture scope.
pub const UNATTRIBUTED_ACTOR: &str = "unattributed";

// --- OPERATIONS ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Insert, Operation::Update, Operation::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn has_old_state(&self) -> bool {
        matches!(self, Operation::Update | Operation::Delete)
    }

    pub fn has_new_state(&self) -> bool {
        matches!(self, Operation::Insert | Operation::Update)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(CaptureError::InvalidFilter(format!(
                "unknown operation '{}'",
                other
            ))),
        }
    }
}

// --- CAPTURE ENTRIES ---
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEntry {
    pub audit_id: i64,
    pub table_name: String,
    pub operation: Operation,
    pub record_id: i64,
    pub old_state: Option<RowDocument>,
    pub new_state: Option<RowDocument>,
    pub captured_at: DateTime<Utc>,
    pub actor: String,
}

impl CaptureEntry {
    /// Columns whose value differs between the before and after snapshots.
    /// Keys present on only one side count as changed. Empty for INSERT and
    /// DELETE.
    pub fn changed_fields(&self) -> Vec<String> {
        let (Some(old), Some(new)) = (&self.old_state, &self.new_state) else {
            return Vec::new();
        };

        let mut changed: Vec<String> = new
            .iter()
            .filter(|(k, v)| old.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();

        for k in old.keys() {
            if !new.contains_key(k) {
                changed.push(k.clone());
            }
        }

        changed
    }

    /// The most recent known state of the row: new_state, or old_state for
    /// deletions.
    pub fn latest_state(&self) -> Option<&RowDocument> {
        self.new_state.as_ref().or(self.old_state.as_ref())
    }
}

/// An entry to append explicitly (the triggers append on their own).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCaptureEntry {
    pub table_name: String,
    pub operation: Operation,
    pub record_id: i64,
    pub old_state: Option<RowDocument>,
    pub new_state: Option<RowDocument>,
    pub actor: String,
}

impl NewCaptureEntry {
    pub fn insert(table: &str, record_id: i64, new_state: RowDocument, actor: &str) -> Self {
        Self {
            table_name: table.to_string(),
            operation: Operation::Insert,
            record_id,
            old_state: None,
            new_state: Some(new_state),
            actor: actor.to_string(),
        }
    }

    pub fn update(
        table: &str,
        record_id: i64,
        old_state: RowDocument,
        new_state: RowDocument,
        actor: &str,
    ) -> Self {
        Self {
            table_name: table.to_string(),
            operation: Operation::Update,
            record_id,
            old_state: Some(old_state),
            new_state: Some(new_state),
            actor: actor.to_string(),
        }
    }

    pub fn delete(table: &str, record_id: i64, old_state: RowDocument, actor: &str) -> Self {
        Self {
            table_name: table.to_string(),
            operation: Operation::Delete,
            record_id,
            old_state: Some(old_state),
            new_state: None,
            actor: actor.to_string(),
        }
    }

    /// Checks the before/after presence pattern for the operation.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.table_name.trim().is_empty() {
            return Err(CaptureError::InvalidEntry("table_name is empty".into()));
        }
        if self.actor.trim().is_empty() {
            return Err(CaptureError::InvalidEntry("actor is empty".into()));
        }
        if self.operation.has_old_state() != self.old_state.is_some() {
            return Err(CaptureError::InvalidEntry(format!(
                "{} entries {} an old_state",
                self.operation,
                if self.operation.has_old_state() { "require" } else { "must not carry" }
            )));
        }
        if self.operation.has_new_state() != self.new_state.is_some() {
            return Err(CaptureError::InvalidEntry(format!(
                "{} entries {} a new_state",
                self.operation,
                if self.operation.has_new_state() { "require" } else { "must not carry" }
            )));
        }
        Ok(())
    }
}

// --- BINDINGS ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Every UPDATE that touches a row is captured, even if nothing changed.
    #[default]
    Unconditional,
    /// UPDATEs that leave the full snapshot unchanged are skipped.
    ChangedOnly,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Unconditional => "unconditional",
            CaptureMode::ChangedOnly => "changed_only",
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureMode {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unconditional" => Ok(CaptureMode::Unconditional),
            "changed_only" => Ok(CaptureMode::ChangedOnly),
            other => Err(CaptureError::Config(format!("unknown capture mode '{}'", other))),
        }
    }
}

/// What an operator registers: a table and the column used as record_id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub table_name: String,
    pub identity_column: String,
    #[serde(default)]
    pub mode: CaptureMode,
}

impl BindingSpec {
    pub fn new(table_name: impl Into<String>, identity_column: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            identity_column: identity_column.into(),
            mode: CaptureMode::Unconditional,
        }
    }

    pub fn changed_only(mut self) -> Self {
        self.mode = CaptureMode::ChangedOnly;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub table_name: String,
    pub identity_column: String,
    pub mode: CaptureMode,
    pub columns: Vec<String>,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindOutcome {
    Bound,
    AlreadyBound,
}

/// One user table and its binding, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCoverage {
    pub table_name: String,
    pub identity_column: Option<String>,
}

impl TableCoverage {
    pub fn is_bound(&self) -> bool {
        self.identity_column.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Bindings whose triggers were regenerated.
    pub refreshed: Vec<String>,
    /// Bindings whose table no longer exists or no longer qualifies.
    pub stale: Vec<String>,
}

// --- READ SIDE ---
#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct CaptureSummary {
    pub table_name: String,
    pub operation: String,
    pub entries: i64,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Keyset position in the log: the last entry of the previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub captured_at: DateTime<Utc>,
    pub audit_id: i64,
}

impl From<&CaptureEntry> for Cursor {
    fn from(entry: &CaptureEntry) -> Self {
        Self {
            captured_at: entry.captured_at,
            audit_id: entry.audit_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub after: Option<Cursor>,
    pub order: SortOrder,
}

impl Page {
    pub const DEFAULT_LIMIT: u32 = 50;

    pub fn newest_first(limit: u32) -> Self {
        Self {
            limit,
            after: None,
            order: SortOrder::NewestFirst,
        }
    }

    pub fn oldest_first(limit: u32) -> Self {
        Self {
            limit,
            after: None,
            order: SortOrder::OldestFirst,
        }
    }

    pub fn after(mut self, cursor: Cursor) -> Self {
        self.after = Some(cursor);
        self
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::newest_first(Self::DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturePage {
    pub entries: Vec<CaptureEntry>,
    /// Present when more entries match; pass it back via `Page::after`.
    pub next: Option<Cursor>,
}

/// Filter over capture entries. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureFilter {
    pub table_name: Option<String>,
    pub operation: Option<Operation>,
    pub record_id: Option<i64>,
    pub actor: Option<String>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub new_state_contains: RowDocument,
    pub old_state_contains: RowDocument,
}

impl CaptureFilter {
    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn for_record(mut self, record_id: i64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn by_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn since(mut self, ts: DateTime<Utc>) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: DateTime<Utc>) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn new_state_has(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.new_state_contains.insert(column.into(), value.into());
        self
    }

    pub fn old_state_has(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.old_state_contains.insert(column.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> RowDocument {
        match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn operation_parses_case_insensitively() {
        assert_eq!("insert".parse::<Operation>().unwrap(), Operation::Insert);
        assert_eq!(" Delete ".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("TRUNCATE".parse::<Operation>().is_err());
    }

    #[test]
    fn new_entry_shape_is_validated() {
        let ok = NewCaptureEntry::insert("products", 1, doc(json!({"id": 1})), "ops");
        assert!(ok.validate().is_ok());

        let mut bad = ok.clone();
        bad.old_state = Some(doc(json!({"id": 1})));
        assert!(matches!(bad.validate(), Err(CaptureError::InvalidEntry(_))));

        let mut no_actor = ok;
        no_actor.actor = "  ".into();
        assert!(no_actor.validate().is_err());
    }

    #[test]
    fn changed_fields_compares_snapshots() {
        let entry = CaptureEntry {
            audit_id: 1,
            table_name: "products".into(),
            operation: Operation::Update,
            record_id: 7,
            old_state: Some(doc(json!({"id": 7, "price": 10.0, "name": "Lamp"}))),
            new_state: Some(doc(json!({"id": 7, "price": 12.5, "name": "Lamp", "sku": "L1"}))),
            captured_at: Utc::now(),
            actor: "ops".into(),
        };
        assert_eq!(entry.changed_fields(), vec!["price".to_string(), "sku".to_string()]);
        assert_eq!(entry.latest_state().unwrap()["price"], json!(12.5));

        let deleted = CaptureEntry {
            operation: Operation::Delete,
            new_state: None,
            ..entry
        };
        assert!(deleted.changed_fields().is_empty());
        assert_eq!(deleted.latest_state().unwrap()["price"], json!(10.0));
    }

    #[test]
    fn operation_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Operation::Update).unwrap(), "\"UPDATE\"");
    }
}
