mod common;

use std::io::{BufRead, BufReader};

use chrono::{Duration, Utc};
use common::*;
use flate2::read::GzDecoder;
use futures::TryStreamExt;
use rowtrail::{CaptureEntry, CaptureError, CaptureFilter, Database, Operation, Page};
use serde_json::json;

/// Three products inserted, one user, then two price changes on product 2.
async fn shop_with_activity() -> Database {
    let db = bound_shop().await;
    add_product(&db, 1, "Lamp", "Home", 10.0).await;
    add_product(&db, 2, "Novel", "Books", 8.0).await;
    add_product(&db, 3, "Atlas", "Books", 30.0).await;
    add_user(&db, 1, "ada@example.com").await;
    for price in [9.0, 7.5] {
        sqlx::query("UPDATE products SET price = ? WHERE id = 2")
            .bind(price)
            .execute(&db.pool)
            .await
            .unwrap();
    }
    db
}

fn ids(entries: &[CaptureEntry]) -> Vec<i64> {
    entries.iter().map(|e| e.record_id).collect()
}

#[tokio::test]
async fn table_and_operation_filter_returns_matches_newest_first() {
    let db = shop_with_activity().await;

    let filter = CaptureFilter::default()
        .for_table("products")
        .with_operation("INSERT".parse::<Operation>().unwrap());
    let page = db.query(&filter, &Page::default()).await.unwrap();

    assert_eq!(ids(&page.entries), [3, 2, 1]);
    assert!(page
        .entries
        .iter()
        .all(|e| e.table_name == "products" && e.operation == Operation::Insert));
    assert!(page.entries.windows(2).all(|w| w[0].captured_at >= w[1].captured_at));
    assert!(page.next.is_none());
    assert_eq!(db.count(&filter).await.unwrap(), 3);
}

#[tokio::test]
async fn containment_filters_match_snapshot_fields() {
    let db = shop_with_activity().await;

    let books = CaptureFilter::default()
        .with_operation(Operation::Insert)
        .new_state_has("category", "Books");
    assert_eq!(ids(&db.query(&books, &Page::default()).await.unwrap().entries), [3, 2]);

    let was_nine = CaptureFilter::default().old_state_has("price", 9.0);
    let entries = db.query(&was_nine, &Page::default()).await.unwrap().entries;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].new_state.as_ref().unwrap()["price"], json!(7.5));

    let no_such_column = CaptureFilter::default().new_state_has("colour", "red");
    assert_eq!(db.count(&no_such_column).await.unwrap(), 0);

    let active_users = CaptureFilter::default().for_table("users").new_state_has("active", 1);
    assert_eq!(db.count(&active_users).await.unwrap(), 1);
}

#[tokio::test]
async fn time_window_is_inclusive_then_exclusive() {
    let db = shop_with_activity().await;
    let all = db.count(&CaptureFilter::default()).await.unwrap();

    let hour = Duration::hours(1);
    let now = Utc::now();

    let around_now = CaptureFilter::default().since(now - hour).until(now + hour);
    assert_eq!(db.count(&around_now).await.unwrap(), all);

    let future = CaptureFilter::default().since(now + hour);
    assert_eq!(db.count(&future).await.unwrap(), 0);

    let oldest = db
        .query(&CaptureFilter::default(), &Page::oldest_first(1))
        .await
        .unwrap()
        .entries
        .remove(0);
    let from_first = CaptureFilter::default().since(oldest.captured_at);
    assert_eq!(db.count(&from_first).await.unwrap(), all);
    let before_first = CaptureFilter::default().until(oldest.captured_at);
    assert_eq!(db.count(&before_first).await.unwrap(), 0);
}

#[tokio::test]
async fn invalid_filters_are_rejected() {
    let db = shop_with_activity().await;

    assert!(matches!(
        db.query(&CaptureFilter::default(), &Page::newest_first(0)).await,
        Err(CaptureError::InvalidFilter(_))
    ));
    assert!(matches!(
        db.count(&CaptureFilter::default().new_state_has("bad\"key", 1)).await,
        Err(CaptureError::InvalidFilter(_))
    ));
    assert!("UPSERT".parse::<Operation>().is_err());
}

#[tokio::test]
async fn cursor_pages_cover_every_entry_once() {
    let db = shop_with_activity().await;
    let total = db.count(&CaptureFilter::default()).await.unwrap() as usize;

    for start in [Page::newest_first(2), Page::oldest_first(2)] {
        let mut seen: Vec<i64> = Vec::new();
        let mut page = start;
        loop {
            let result = db.query(&CaptureFilter::default(), &page).await.unwrap();
            assert!(result.entries.len() <= 2);
            seen.extend(result.entries.iter().map(|e| e.audit_id));
            match result.next {
                Some(cursor) => page = page.after(cursor),
                None => break,
            }
        }

        assert_eq!(seen.len(), total);
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), total);
    }
}

#[tokio::test]
async fn entry_stream_is_lazy_and_restartable() {
    let db = shop_with_activity().await;
    let total = db.count(&CaptureFilter::default()).await.unwrap() as usize;

    let streamed: Vec<CaptureEntry> = db
        .entries(CaptureFilter::default(), Page::oldest_first(2))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(streamed.len(), total);
    assert!(streamed.windows(2).all(|w| w[0].audit_id < w[1].audit_id));

    // Resume after the third entry.
    let resumed: Vec<CaptureEntry> = db
        .entries(
            CaptureFilter::default(),
            Page::oldest_first(2).after((&streamed[2]).into()),
        )
        .try_collect()
        .await
        .unwrap();
    assert_eq!(resumed, streamed[3..]);
}

#[tokio::test]
async fn recent_and_single_entry_lookups() {
    let db = shop_with_activity().await;

    let recent = db.recent(2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].operation, Operation::Update);
    assert_eq!(recent[0].record_id, 2);

    let fetched = db.entry(recent[1].audit_id).await.unwrap();
    assert_eq!(fetched.as_ref(), Some(&recent[1]));
    assert_eq!(db.entry(-1).await.unwrap(), None);
}

#[tokio::test]
async fn malformed_rows_are_reported_not_skipped() {
    let db = shop_with_activity().await;
    sqlx::query(
        "INSERT INTO capture_log (table_name, operation, record_id, new_state, actor)
         VALUES ('products', 'INSERT', 99, '[1,2,3]', 'script')",
    )
    .execute(&db.pool)
    .await
    .unwrap();

    let err = db.recent(1).await.unwrap_err();
    assert!(matches!(err, CaptureError::MalformedEntry { .. }), "unexpected error: {}", err);
}

#[tokio::test]
async fn summary_groups_by_table_and_operation() {
    let db = shop_with_activity().await;
    let summary = db.summary().await.unwrap();

    let find = |table: &str, op: &str| {
        summary
            .iter()
            .find(|s| s.table_name == table && s.operation == op)
            .map(|s| s.entries)
    };
    assert_eq!(find("products", "INSERT"), Some(3));
    assert_eq!(find("products", "UPDATE"), Some(2));
    assert_eq!(find("users", "INSERT"), Some(1));
    assert_eq!(find("users", "DELETE"), None);

    assert_eq!(summary[0].table_name, "products");
    assert_eq!(summary[0].operation, "UPDATE");
    assert!(summary.windows(2).all(|w| w[0].last_activity >= w[1].last_activity));
}

#[tokio::test]
async fn export_writes_gzipped_json_lines_oldest_first() {
    let db = shop_with_activity().await;

    let mut buffer: Vec<u8> = Vec::new();
    let filter = CaptureFilter::default().for_table("products");
    let written = db.export_jsonl_gz(&filter, &mut buffer).await.unwrap();
    assert_eq!(written, 5);

    let lines: Vec<CaptureEntry> = BufReader::new(GzDecoder::new(&buffer[..]))
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect();
    assert_eq!(lines.len(), 5);
    assert!(lines.windows(2).all(|w| w[0].audit_id < w[1].audit_id));

    let expected: Vec<CaptureEntry> = db
        .entries(filter, Page::oldest_first(50))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(lines, expected);
}
