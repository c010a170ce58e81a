// ========================================
// error.rs - Error taxonomy for change capture
// ========================================
// Capture failures are failures of the mutation that triggered them, so the
// same enum is returned by mutations run through a capture scope and by the
// administrative/read API.

use thiserror::Error;

/// Text carried by the abort a capture trigger raises when its table's
/// columns no longer match the ones it was generated for.
pub(crate) const SCHEMA_DRIFT_MARKER: &str = "columns changed since binding";

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// A row could not be turned into a structured document (for example a
    /// BLOB column, or a JSON-typed column holding malformed JSON).
    #[error("row could not be serialized for capture: {reason}")]
    Serialization { reason: String },

    /// The append to the capture log failed for a storage-level reason.
    #[error("capture log write failed: {0}")]
    Write(#[source] sqlx::Error),

    #[error("invalid binding for table '{table}': {reason}")]
    InvalidBinding { table: String, reason: String },

    #[error("table '{table}' is already bound on '{existing}' ({mode}); unbind it first")]
    BindingConflict {
        table: String,
        existing: String,
        mode: String,
    },

    #[error("invalid capture entry: {0}")]
    InvalidEntry(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("malformed capture entry {audit_id}: {reason}")]
    MalformedEntry { audit_id: i64, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Classifies an error raised while executing a mutation against a
    /// (possibly) tracked table.
    ///
    /// SQLite reports snapshot failures from inside the capture trigger as
    /// plain database errors; the message is the only thing that tells them
    /// apart from the caller's own constraint violations.
    pub fn from_mutation(err: sqlx::Error) -> Self {
        let message = match &err {
            sqlx::Error::Database(db) => db.message().to_string(),
            _ => return CaptureError::Database(err),
        };

        let lowered = message.to_lowercase();

        if lowered.contains("json cannot hold blob")
            || lowered.contains("malformed json")
            || lowered.contains(SCHEMA_DRIFT_MARKER)
        {
            return CaptureError::Serialization { reason: message };
        }

        if lowered.contains("capture_log") || lowered.contains("capture_session") {
            return CaptureError::Write(err);
        }

        CaptureError::Database(err)
    }

    pub fn is_serialization(&self) -> bool {
        matches!(self, CaptureError::Serialization { .. })
    }

    pub fn is_write(&self) -> bool {
        matches!(self, CaptureError::Write(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_pass_through() {
        let err = CaptureError::from_mutation(sqlx::Error::RowNotFound);
        assert!(matches!(err, CaptureError::Database(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn display_names_the_table() {
        let err = CaptureError::InvalidBinding {
            table: "products".into(),
            reason: "no such column 'sku'".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid binding for table 'products': no such column 'sku'"
        );
    }
}
