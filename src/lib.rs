// ========================================
// lib.rs - rowtrail
// ========================================
// Row-level change capture for SQLite. Bound tables get generated triggers
// that append a structured before/after snapshot of every inserted, updated
// or deleted row to an append-only log, inside the same transaction as the
// mutation.

pub mod config;
pub mod db;
pub mod error;
pub mod logger;
pub mod model;
pub mod registry;

pub use config::{CaptureConfig, DatabaseLocation};
pub use db::{CaptureScope, Database};
pub use error::{CaptureError, Result};
pub use model::{
    BindOutcome, Binding, BindingSpec, CaptureEntry, CaptureFilter, CaptureMode, CapturePage,
    CaptureSummary, Cursor, NewCaptureEntry, Operation, Page, RefreshReport, RowDocument,
    SortOrder, TableCoverage, UNATTRIBUTED_ACTOR,
};
