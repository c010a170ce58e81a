#![allow(dead_code)]

use rowtrail::{BindingSpec, CaptureConfig, Database};
use tempfile::TempDir;

/// A small shop: users place orders made of order items that reference
/// products. Deleting an order cascades to its items.
pub const SHOP_SCHEMA: &str = r#"
CREATE TABLE users (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE products (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    price REAL NOT NULL,
    stock INTEGER NOT NULL DEFAULT 0,
    tags JSON,
    thumbnail BLOB
);

CREATE TABLE orders (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    status TEXT NOT NULL DEFAULT 'pending',
    total REAL NOT NULL DEFAULT 0
);

CREATE TABLE order_items (
    id INTEGER PRIMARY KEY,
    order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    product_id INTEGER NOT NULL REFERENCES products(id),
    quantity INTEGER NOT NULL,
    unit_price REAL NOT NULL,
    subtotal REAL GENERATED ALWAYS AS (quantity * unit_price) STORED
);

CREATE TABLE page_views (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL
);
"#;

pub const SHOP_TABLES: [&str; 4] = ["users", "products", "orders", "order_items"];

pub async fn memory_db() -> Database {
    let db = Database::connect(&CaptureConfig::in_memory())
        .await
        .expect("connect to in-memory database");
    create_shop(&db).await;
    db
}

/// File-backed database, for tests that need more than one connection.
pub async fn file_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::connect(&CaptureConfig::file(dir.path().join("shop.db")))
        .await
        .expect("connect to file database");
    create_shop(&db).await;
    (dir, db)
}

pub async fn create_shop(db: &Database) {
    sqlx::raw_sql(SHOP_SCHEMA)
        .execute(&db.pool)
        .await
        .expect("create shop schema");
}

pub async fn bind_shop(db: &Database) {
    for table in SHOP_TABLES {
        db.bind(&BindingSpec::new(table, "id"))
            .await
            .expect("bind shop table");
    }
}

pub async fn bound_shop() -> Database {
    let db = memory_db().await;
    bind_shop(&db).await;
    db
}

pub async fn add_user(db: &Database, id: i64, email: &str) {
    sqlx::query("INSERT INTO users (id, email, name) VALUES (?, ?, ?)")
        .bind(id)
        .bind(email)
        .bind(email.split('@').next().unwrap_or(email))
        .execute(&db.pool)
        .await
        .expect("insert user");
}

pub async fn add_product(db: &Database, id: i64, name: &str, category: &str, price: f64) {
    sqlx::query("INSERT INTO products (id, name, category, price, stock) VALUES (?, ?, ?, ?, 10)")
        .bind(id)
        .bind(name)
        .bind(category)
        .bind(price)
        .execute(&db.pool)
        .await
        .expect("insert product");
}

/// One order for `user_id` with one item per product id.
pub async fn add_order(db: &Database, order_id: i64, user_id: i64, product_ids: &[i64]) {
    sqlx::query("INSERT INTO orders (id, user_id, status) VALUES (?, ?, 'pending')")
        .bind(order_id)
        .bind(user_id)
        .execute(&db.pool)
        .await
        .expect("insert order");

    for product_id in product_ids {
        sqlx::query(
            "INSERT INTO order_items (order_id, product_id, quantity, unit_price)
             SELECT ?, id, 2, price FROM products WHERE id = ?",
        )
        .bind(order_id)
        .bind(product_id)
        .execute(&db.pool)
        .await
        .expect("insert order item");
    }
}

pub async fn log_size(db: &Database) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM capture_log")
        .fetch_one(&db.pool)
        .await
        .expect("count capture_log")
}
