// ========================================
// audit.rs - Read side of the capture log
// ========================================
// Filtered, ordered, paginated reads over capture_log. Nothing here writes
// to the log.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::helpers::sql_timestamp;
use crate::db::Database;
use crate::error::{CaptureError, Result};
use crate::model::{
    CaptureEntry, CaptureFilter, CapturePage, CaptureSummary, Cursor, Operation, Page, RowDocument,
    SortOrder,
};

const ENTRY_COLUMNS: &str =
    "audit_id, table_name, operation, record_id, old_state, new_state, captured_at, actor";

impl Database {
    /// One page of matching entries. Pass `CapturePage::next` back through
    /// `Page::after` to continue where the page ended.
    pub async fn query(&self, filter: &CaptureFilter, page: &Page) -> Result<CapturePage> {
        if page.limit == 0 {
            return Err(CaptureError::InvalidFilter("page limit must be at least 1".into()));
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM capture_log", ENTRY_COLUMNS));
        push_filter(&mut qb, filter)?;

        if let Some(cursor) = &page.after {
            let cmp = match page.order {
                SortOrder::NewestFirst => "<",
                SortOrder::OldestFirst => ">",
            };
            qb.push(format!(" AND (captured_at, audit_id) {} (", cmp))
                .push_bind(sql_timestamp(&cursor.captured_at))
                .push(", ")
                .push_bind(cursor.audit_id)
                .push(")");
        }

        push_order(&mut qb, page.order);
        // One extra row tells whether another page exists.
        qb.push(" LIMIT ").push_bind(i64::from(page.limit) + 1);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>>>()?;

        let limit = page.limit as usize;
        let next = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(Cursor::from)
        } else {
            None
        };

        Ok(CapturePage { entries, next })
    }

    /// Lazy sequence of every matching entry, fetched a page at a time.
    /// Finite; restart it from any point with `Page::after`.
    pub fn entries(&self, filter: CaptureFilter, page: Page) -> BoxStream<'static, Result<CaptureEntry>> {
        let db = self.clone();

        stream::try_unfold(Some(page), move |state| {
            let db = db.clone();
            let filter = filter.clone();
            async move {
                let Some(page) = state else {
                    return Ok::<_, CaptureError>(None);
                };
                let result = db.query(&filter, &page).await?;
                let next_page = result.next.map(|cursor| page.after(cursor));
                Ok(Some((result.entries, next_page)))
            }
        })
        .map_ok(|entries| stream::iter(entries.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    /// Most recent entries across every table.
    pub async fn recent(&self, limit: u32) -> Result<Vec<CaptureEntry>> {
        Ok(self
            .query(&CaptureFilter::default(), &Page::newest_first(limit))
            .await?
            .entries)
    }

    pub async fn entry(&self, audit_id: i64) -> Result<Option<CaptureEntry>> {
        let sql = format!("SELECT {} FROM capture_log WHERE audit_id = ?", ENTRY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(audit_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    pub async fn count(&self, filter: &CaptureFilter) -> Result<i64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM capture_log");
        push_filter(&mut qb, filter)?;
        Ok(qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?)
    }

    /// Every entry for one row, oldest first.
    pub async fn record_history(&self, table: &str, record_id: i64) -> Result<Vec<CaptureEntry>> {
        let filter = CaptureFilter::default().for_table(table).for_record(record_id);

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM capture_log", ENTRY_COLUMNS));
        push_filter(&mut qb, &filter)?;
        push_order(&mut qb, SortOrder::OldestFirst);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// The row as it stood right after entry `as_of` was written, rebuilt
    /// from the log. `None` if the row did not exist at that point.
    pub async fn record_state_at(
        &self,
        table: &str,
        record_id: i64,
        as_of: i64,
    ) -> Result<Option<RowDocument>> {
        let sql = format!(
            "SELECT {} FROM capture_log
             WHERE table_name = ? AND record_id = ? AND audit_id <= ?
             ORDER BY audit_id DESC
             LIMIT 1",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(table)
            .bind(record_id)
            .bind(as_of)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(row_to_entry(&row)?.new_state)
    }

    /// Entry counts per (table, operation), most recently active first.
    pub async fn summary(&self) -> Result<Vec<CaptureSummary>> {
        let rows = sqlx::query_as::<_, CaptureSummary>(
            "SELECT table_name, operation, COUNT(*) AS entries, MAX(captured_at) AS last_activity
             FROM capture_log
             GROUP BY table_name, operation
             ORDER BY last_activity DESC, MAX(audit_id) DESC"
        )
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &CaptureFilter) -> Result<()> {
    qb.push(" WHERE 1=1");

    if let Some(table) = &filter.table_name {
        qb.push(" AND table_name = ").push_bind(table.clone());
    }
    if let Some(operation) = filter.operation {
        qb.push(" AND operation = ").push_bind(operation.as_str());
    }
    if let Some(record_id) = filter.record_id {
        qb.push(" AND record_id = ").push_bind(record_id);
    }
    if let Some(actor) = &filter.actor {
        qb.push(" AND actor = ").push_bind(actor.clone());
    }
    if let Some(since) = &filter.since {
        qb.push(" AND captured_at >= ").push_bind(sql_timestamp(since));
    }
    if let Some(until) = &filter.until {
        qb.push(" AND captured_at < ").push_bind(sql_timestamp(until));
    }
    if let (Some(since), Some(until)) = (&filter.since, &filter.until) {
        if since >= until {
            return Err(CaptureError::InvalidFilter(
                "time range is empty: 'since' must be before 'until'".into(),
            ));
        }
    }

    for (column, value) in &filter.new_state_contains {
        push_containment(qb, "new_state", column, value)?;
    }
    for (column, value) in &filter.old_state_contains {
        push_containment(qb, "old_state", column, value)?;
    }

    Ok(())
}

/// `<document>.<column> == value` for a scalar value. The bound value goes through
/// json_extract as well so both sides get the same SQL representation
/// (JSON true compares equal to a stored boolean column's 1).
fn push_containment(
    qb: &mut QueryBuilder<'_, Sqlite>,
    document: &'static str,
    column: &str,
    value: &Value,
) -> Result<()> {
    let path = json_path(column)?;
    if value.is_object() || value.is_array() {
        return Err(CaptureError::InvalidFilter(format!(
            "column {:?} can only be matched against a scalar value",
            column
        )));
    }

    qb.push(format!(" AND json_type({}, ", document))
        .push_bind(path.clone())
        .push(") IS NOT NULL");
    qb.push(format!(" AND json_extract({}, ", document))
        .push_bind(path)
        .push(") IS json_extract(")
        .push_bind(value.to_string())
        .push(", '$')");

    Ok(())
}

fn json_path(column: &str) -> Result<String> {
    if column.is_empty() || column.contains('"') {
        return Err(CaptureError::InvalidFilter(format!(
            "cannot match on column name {:?}",
            column
        )));
    }
    Ok(format!("$.\"{}\"", column))
}

fn push_order(qb: &mut QueryBuilder<'_, Sqlite>, order: SortOrder) {
    qb.push(match order {
        SortOrder::NewestFirst => " ORDER BY captured_at DESC, audit_id DESC",
        SortOrder::OldestFirst => " ORDER BY captured_at ASC, audit_id ASC",
    });
}

fn row_to_entry(row: &SqliteRow) -> Result<CaptureEntry> {
    let audit_id: i64 = row.try_get("audit_id")?;
    let malformed = |reason: String| CaptureError::MalformedEntry { audit_id, reason };

    let raw_operation: String = row.try_get("operation")?;
    let operation: Operation = raw_operation
        .parse()
        .map_err(|_| malformed(format!("unknown operation '{}'", raw_operation)))?;

    let old_state = parse_document(row.try_get("old_state")?).map_err(|e| malformed(format!("old_state: {}", e)))?;
    let new_state = parse_document(row.try_get("new_state")?).map_err(|e| malformed(format!("new_state: {}", e)))?;

    Ok(CaptureEntry {
        audit_id,
        table_name: row.try_get("table_name")?,
        operation,
        record_id: row.try_get("record_id")?,
        old_state,
        new_state,
        captured_at: row.try_get("captured_at")?,
        actor: row.try_get("actor")?,
    })
}

fn parse_document(raw: Option<String>) -> std::result::Result<Option<RowDocument>, String> {
    raw.map(|text| match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, found {}", other)),
        Err(e) => Err(e.to_string()),
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_paths_quote_the_column() {
        assert_eq!(json_path("unit price").unwrap(), "$.\"unit price\"");
        assert!(json_path("").is_err());
        assert!(json_path("we\"ird").is_err());
    }

    #[test]
    fn filter_sql_has_one_predicate_per_field() {
        let filter = CaptureFilter::default()
            .for_table("products")
            .with_operation(Operation::Insert)
            .new_state_has("category", "Books");

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM capture_log");
        push_filter(&mut qb, &filter).unwrap();
        let sql = qb.sql();

        assert!(sql.contains("AND table_name = ?"));
        assert!(sql.contains("AND operation = ?"));
        assert!(sql.contains("AND json_type(new_state, ?) IS NOT NULL"));
        assert!(sql.contains("AND json_extract(new_state, ?) IS json_extract(?, '$')"));
        assert!(!sql.contains("record_id"));
    }

    #[test]
    fn empty_time_ranges_are_rejected() {
        let now = chrono::Utc::now();
        let filter = CaptureFilter::default().since(now).until(now);
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT 1");
        assert!(matches!(push_filter(&mut qb, &filter), Err(CaptureError::InvalidFilter(_))));
    }

    #[test]
    fn documents_must_be_objects() {
        assert_eq!(parse_document(None), Ok(None));
        assert_eq!(
            parse_document(Some(json!({"id": 1}).to_string())).unwrap().unwrap()["id"],
            json!(1)
        );
        assert!(parse_document(Some("[1,2]".into())).is_err());
        assert!(parse_document(Some("{".into())).is_err());
    }

    #[test]
    fn containment_takes_scalars_only() {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT 1");
        for value in [json!({"a": 2, "b": 1}), json!([1, 2])] {
            assert!(matches!(
                push_containment(&mut qb, "new_state", "tags", &value),
                Err(CaptureError::InvalidFilter(_))
            ));
        }
        for value in [json!("Books"), json!(7.5), json!(true), json!(null)] {
            assert!(push_containment(&mut qb, "new_state", "category", &value).is_ok());
        }
    }
}
