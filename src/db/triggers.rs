// ========================================
// triggers.rs - Capture trigger generation
// ========================================
// One routine produces the row-level capture logic for any tracked table,
// parameterised by table name, identity column, capture mode and the live
// column list. Each binding gets three AFTER ... FOR EACH ROW triggers that
// append to capture_log inside the mutating statement's transaction.
// Each trigger first checks the table still has the columns it was generated
// for and aborts the mutation if not.

use serde_json::Value;

use super::helpers::{column_names, quote_ident, quote_literal, TableColumn};
use crate::error::SCHEMA_DRIFT_MARKER;
use crate::model::{CaptureMode, Operation, UNATTRIBUTED_ACTOR};

pub const TRIGGER_PREFIX: &str = "rowtrail_";

// json_object takes two arguments per column and SQLite's default
// SQLITE_MAX_FUNCTION_ARG is 127.
const COLUMNS_PER_CALL: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRef {
    New,
    Old,
}

impl RowRef {
    fn as_str(&self) -> &'static str {
        match self {
            RowRef::New => "NEW",
            RowRef::Old => "OLD",
        }
    }
}

/// Everything the generator needs to know about one binding.
#[derive(Debug, Clone)]
pub struct TriggerSpec<'a> {
    pub table: &'a str,
    pub identity_column: &'a str,
    pub mode: CaptureMode,
    pub columns: &'a [TableColumn],
}

pub fn trigger_name(table: &str, op: Operation) -> String {
    format!("{}{}_{}", TRIGGER_PREFIX, table, op.as_str().to_ascii_lowercase())
}

pub fn trigger_names(table: &str) -> [String; 3] {
    Operation::ALL.map(|op| trigger_name(table, op))
}

pub fn drop_trigger_sql(table: &str, op: Operation) -> String {
    format!("DROP TRIGGER IF EXISTS {}", quote_ident(&trigger_name(table, op)))
}

fn actor_expr() -> String {
    format!(
        "COALESCE((SELECT actor FROM capture_session WHERE slot = 1), {})",
        quote_literal(UNATTRIBUTED_ACTOR)
    )
}

/// JSON array of the column names, the same text stored in
/// `capture_bindings.columns_fingerprint`.
pub fn columns_fingerprint(columns: &[TableColumn]) -> String {
    Value::from(column_names(columns)).to_string()
}

/// Aborts the mutation when the live column list differs from `columns`.
fn drift_guard(table: &str, columns: &[TableColumn]) -> String {
    let message = format!("rowtrail: {} {}; refresh bindings", table, SCHEMA_DRIFT_MARKER);
    format!(
        "SELECT RAISE(ABORT, {message})\n        \
         WHERE (SELECT json_group_array(name) FROM (\n            \
             SELECT name FROM pragma_table_xinfo({table}) WHERE hidden != 1 ORDER BY cid\n        \
         )) IS NOT {fingerprint};",
        message = quote_literal(&message),
        table = quote_literal(table),
        fingerprint = quote_literal(&columns_fingerprint(columns)),
    )
}

fn column_value(row: RowRef, column: &TableColumn) -> String {
    let value = format!("{}.{}", row.as_str(), quote_ident(&column.name));
    if column.is_json() {
        // Embed JSON columns as nested documents rather than strings.
        format!("json({})", value)
    } else {
        value
    }
}

/// `json_object(...)` over every column of the row. Wide tables are split
/// into one json_object call plus chained json_insert calls so that no call
/// exceeds the function argument limit.
pub fn snapshot_expr(row: RowRef, columns: &[TableColumn]) -> String {
    let mut chunks = columns.chunks(COLUMNS_PER_CALL);

    let first = chunks.next().unwrap_or(&[]);
    let mut expr = format!(
        "json_object({})",
        first
            .iter()
            .map(|c| format!("{}, {}", quote_literal(&c.name), column_value(row, c)))
            .collect::<Vec<_>>()
            .join(", ")
    );

    for chunk in chunks {
        let pairs = chunk
            .iter()
            .map(|c| {
                format!(
                    "{}, {}",
                    quote_literal(&format!("$.\"{}\"", c.name)),
                    column_value(row, c)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        expr = format!("json_insert({}, {})", expr, pairs);
    }

    expr
}

pub fn create_trigger_sql(spec: &TriggerSpec<'_>, op: Operation) -> String {
    let name = quote_ident(&trigger_name(spec.table, op));
    let table = quote_ident(spec.table);
    let table_literal = quote_literal(spec.table);
    let identity = quote_ident(spec.identity_column);

    let (event, record_ref, old_state, new_state) = match op {
        Operation::Insert => (
            "INSERT",
            RowRef::New,
            "NULL".to_string(),
            snapshot_expr(RowRef::New, spec.columns),
        ),
        Operation::Update => (
            "UPDATE",
            RowRef::New,
            snapshot_expr(RowRef::Old, spec.columns),
            snapshot_expr(RowRef::New, spec.columns),
        ),
        Operation::Delete => (
            "DELETE",
            RowRef::Old,
            snapshot_expr(RowRef::Old, spec.columns),
            "NULL".to_string(),
        ),
    };

    let when = match (op, spec.mode) {
        (Operation::Update, CaptureMode::ChangedOnly) => {
            format!("\nWHEN {} IS NOT {}", old_state, new_state)
        }
        _ => String::new(),
    };

    format!(
        "CREATE TRIGGER IF NOT EXISTS {name}\n\
         AFTER {event} ON {table}\n\
         FOR EACH ROW{when}\n\
         BEGIN\n    \
             {guard}\n    \
             INSERT INTO capture_log (table_name, operation, record_id, old_state, new_state, actor)\n    \
             VALUES ({table_literal}, '{op}', {row}.{identity}, {old_state}, {new_state}, {actor});\n\
         END",
        op = op.as_str(),
        row = record_ref.as_str(),
        guard = drift_guard(spec.table, spec.columns),
        actor = actor_expr(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, decl_type: &str, pk: i64) -> TableColumn {
        TableColumn {
            name: name.to_string(),
            decl_type: decl_type.to_string(),
            pk,
            hidden: 0,
        }
    }

    fn products() -> Vec<TableColumn> {
        vec![
            col("product_id", "INTEGER", 1),
            col("name", "TEXT", 0),
            col("price", "REAL", 0),
            col("tags", "JSON", 0),
        ]
    }

    #[test]
    fn insert_trigger_captures_new_row_only() {
        let columns = products();
        let spec = TriggerSpec {
            table: "products",
            identity_column: "product_id",
            mode: CaptureMode::Unconditional,
            columns: &columns,
        };
        let sql = create_trigger_sql(&spec, Operation::Insert);

        assert!(sql.starts_with("CREATE TRIGGER IF NOT EXISTS \"rowtrail_products_insert\""));
        assert!(sql.contains("AFTER INSERT ON \"products\""));
        assert!(sql.contains("VALUES ('products', 'INSERT', NEW.\"product_id\", NULL, json_object("));
        assert!(sql.contains("'tags', json(NEW.\"tags\")"));
        assert!(!sql.contains("OLD."));
        assert!(!sql.contains("WHEN"));
    }

    #[test]
    fn delete_trigger_uses_old_identity() {
        let columns = products();
        let spec = TriggerSpec {
            table: "products",
            identity_column: "product_id",
            mode: CaptureMode::Unconditional,
            columns: &columns,
        };
        let sql = create_trigger_sql(&spec, Operation::Delete);

        assert!(sql.contains("'DELETE', OLD.\"product_id\", json_object('product_id', OLD.\"product_id\""));
        assert!(sql.trim_end().ends_with(", NULL, COALESCE((SELECT actor FROM capture_session WHERE slot = 1), 'unattributed'));\nEND"));
    }

    #[test]
    fn changed_only_updates_get_a_when_clause() {
        let columns = products();
        let spec = TriggerSpec {
            table: "products",
            identity_column: "product_id",
            mode: CaptureMode::ChangedOnly,
            columns: &columns,
        };
        let update = create_trigger_sql(&spec, Operation::Update);
        assert!(update.contains("WHEN json_object('product_id', OLD.\"product_id\""));
        assert!(update.contains(" IS NOT json_object('product_id', NEW.\"product_id\""));

        let insert = create_trigger_sql(&spec, Operation::Insert);
        assert!(!insert.contains("WHEN"));
    }

    #[test]
    fn wide_tables_are_chunked() {
        let columns: Vec<TableColumn> = (0..130)
            .map(|i| col(&format!("c{}", i), "TEXT", if i == 0 { 1 } else { 0 }))
            .collect();
        let expr = snapshot_expr(RowRef::New, &columns);

        assert_eq!(expr.matches("json_insert(").count(), 2);
        assert!(expr.contains("'$.\"c60\"', NEW.\"c60\""));
        assert!(expr.contains("'$.\"c129\"', NEW.\"c129\""));
        assert!(expr.contains("'c59', NEW.\"c59\""));
    }

    #[test]
    fn triggers_check_the_column_list_first() {
        let columns = products();
        let spec = TriggerSpec {
            table: "products",
            identity_column: "product_id",
            mode: CaptureMode::Unconditional,
            columns: &columns,
        };
        let sql = create_trigger_sql(&spec, Operation::Update);

        assert_eq!(columns_fingerprint(&columns), r#"["product_id","name","price","tags"]"#);
        let guard = sql.find("RAISE(ABORT, 'rowtrail: products columns changed since binding").unwrap();
        assert!(guard < sql.find("INSERT INTO capture_log").unwrap());
        assert!(sql.contains("FROM pragma_table_xinfo('products') WHERE hidden != 1 ORDER BY cid"));
        assert!(sql.contains(r#"IS NOT '["product_id","name","price","tags"]';"#));
    }

    #[test]
    fn odd_table_names_are_quoted() {
        let columns = vec![col("id", "INTEGER", 1)];
        let spec = TriggerSpec {
            table: "o'rders",
            identity_column: "id",
            mode: CaptureMode::Unconditional,
            columns: &columns,
        };
        let sql = create_trigger_sql(&spec, Operation::Insert);
        assert!(sql.contains("ON \"o'rders\""));
        assert!(sql.contains("VALUES ('o''rders', 'INSERT'"));
    }

    #[test]
    fn trigger_names_cover_every_operation() {
        assert_eq!(
            trigger_names("users"),
            [
                "rowtrail_users_insert".to_string(),
                "rowtrail_users_update".to_string(),
                "rowtrail_users_delete".to_string(),
            ]
        );
    }
}
