use tempfile::TempDir;

use shelfwise::stores::SqliteStore;
use shelfwise_core::models::SqlValue;
use shelfwise_core::schema::{StoreSource, INVENTORY_COLUMNS};
use shelfwise_core::store::{refresh_inventory_view, BackendKind, DataStore};

async fn store_with_items(tmp: &TempDir, items_ddl: &str, insert: &str) -> SqliteStore {
    let store = SqliteStore::open(&tmp.path().join("adapt.sqlite"), BackendKind::Mirror, true)
        .await
        .unwrap();
    for sql in [
        "CREATE TABLE vip_brands (vip_brand_id INTEGER, brand_name TEXT, short_name TEXT)",
        "CREATE TABLE vip_products (vip_product_id INTEGER, vip_brand_id INTEGER, product_name TEXT, fanciful_name TEXT)",
        "INSERT INTO vip_brands VALUES (1, '  ', 'AC')",
        "INSERT INTO vip_products VALUES (10, 1, ' ', 'Night Vodka')",
        items_ddl,
        insert,
    ] {
        store.execute(sql, &[]).await.unwrap();
    }
    store
}

async fn view(store: &SqliteStore) -> shelfwise_core::models::Table {
    store
        .query("SELECT * FROM app_inventory", &[])
        .await
        .unwrap()
}

#[tokio::test]
async fn test_store_column_is_used_directly() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_items(
        &tmp,
        "CREATE TABLE vip_items (store INTEGER, vip_product_id INTEGER, quantity INTEGER)",
        "INSERT INTO vip_items VALUES (2, 10, 6)",
    )
    .await;

    assert_eq!(refresh_inventory_view(&store).await.unwrap(), StoreSource::Store);
    let table = view(&store).await;
    assert_eq!(table.columns, INVENTORY_COLUMNS);
    assert_eq!(table.get(0, "store"), Some(&SqlValue::Text("2".into())));
    assert_eq!(table.text(0, "product_name").as_deref(), Some("Night Vodka"));
    assert_eq!(table.text(0, "brand_name").as_deref(), Some("AC"));
    assert_eq!(table.get(0, "quantity"), Some(&SqlValue::Integer(6)));
}

#[tokio::test]
async fn test_source_id_gets_prefixed() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_items(
        &tmp,
        "CREATE TABLE vip_items (source_id INTEGER, vip_product_id INTEGER, quantity INTEGER)",
        "INSERT INTO vip_items VALUES (7, 10, 1)",
    )
    .await;

    assert_eq!(refresh_inventory_view(&store).await.unwrap(), StoreSource::SourceId);
    let table = view(&store).await;
    assert_eq!(table.columns, INVENTORY_COLUMNS);
    assert_eq!(table.text(0, "store").as_deref(), Some("source_7"));
}

#[tokio::test]
async fn test_missing_store_columns_yield_null() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_items(
        &tmp,
        "CREATE TABLE vip_items (vip_product_id INTEGER)",
        "INSERT INTO vip_items VALUES (10)",
    )
    .await;

    assert_eq!(refresh_inventory_view(&store).await.unwrap(), StoreSource::Missing);
    let table = view(&store).await;
    assert_eq!(table.columns, INVENTORY_COLUMNS);
    assert_eq!(table.get(0, "store"), Some(&SqlValue::Null));
    assert_eq!(table.get(0, "quantity"), Some(&SqlValue::Null));
    assert_eq!(table.text(0, "product_name").as_deref(), Some("Night Vodka"));
}

#[tokio::test]
async fn test_refresh_is_repeatable_after_schema_change() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_items(
        &tmp,
        "CREATE TABLE vip_items (vip_product_id INTEGER, quantity INTEGER)",
        "INSERT INTO vip_items VALUES (10, 3)",
    )
    .await;
    assert_eq!(refresh_inventory_view(&store).await.unwrap(), StoreSource::Missing);

    store
        .execute("ALTER TABLE vip_items ADD COLUMN store TEXT", &[])
        .await
        .unwrap();
    store
        .execute("UPDATE vip_items SET store = '9'", &[])
        .await
        .unwrap();
    assert_eq!(refresh_inventory_view(&store).await.unwrap(), StoreSource::Store);
    assert_eq!(view(&store).await.text(0, "store").as_deref(), Some("9"));
}

#[tokio::test]
async fn test_missing_table_is_reported() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&tmp.path().join("empty.sqlite"), BackendKind::Mirror, true)
        .await
        .unwrap();
    let err = refresh_inventory_view(&store).await.unwrap_err();
    assert!(err.to_string().contains("vip_items"));
}
