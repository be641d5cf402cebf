//! Table names and the `app_inventory` view builder.
//!
//! Dumps come from several catalogue versions. Older ones carry a `store`
//! column on `vip_items`, newer ones only a numeric `source_id`, and some
//! neither. The view hides that behind a fixed column set:
//!
//! | column         | derived from                                           |
//! |----------------|--------------------------------------------------------|
//! | `store`        | `store`, else `'source_' \|\| source_id`, else NULL    |
//! | `product_name` | [`PRODUCT_NAME_COLUMNS`] priority                      |
//! | `brand_name`   | [`BRAND_NAME_COLUMNS`] priority                        |
//! | `quantity`     | `quantity`, else NULL                                  |

use serde::Serialize;

use crate::names::{coalesce_sql, BRAND_NAME_COLUMNS, PRODUCT_NAME_COLUMNS};

pub const ITEMS_TABLE: &str = "vip_items";
pub const PRODUCTS_TABLE: &str = "vip_products";
pub const BRANDS_TABLE: &str = "vip_brands";
pub const INVENTORY_VIEW: &str = "app_inventory";

/// Output columns of [`INVENTORY_VIEW`], in order.
pub const INVENTORY_COLUMNS: [&str; 4] = ["store", "product_name", "brand_name", "quantity"];

/// Prefix for store labels synthesised from `source_id`.
pub const SOURCE_PREFIX: &str = "source_";

const PRODUCT_KEY: &str = "vip_product_id";
const BRAND_KEY: &str = "vip_brand_id";

/// SQL flavour of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Strip spaces, tabs and newlines from both ends of `expr`.
    pub fn trim(&self, expr: &str) -> String {
        match self {
            // SQLite's one-argument TRIM only removes spaces.
            Dialect::Sqlite => format!("TRIM({}, ' ' || char(9) || char(10) || char(13))", expr),
            Dialect::Postgres => format!("BTRIM({}, E' \\t\\n\\r')", expr),
        }
    }

    pub fn as_text(&self, expr: &str) -> String {
        format!("CAST({} AS TEXT)", expr)
    }

    pub fn as_integer(&self, expr: &str) -> String {
        match self {
            Dialect::Sqlite => format!("CAST({} AS INTEGER)", expr),
            Dialect::Postgres => format!("CAST({} AS BIGINT)", expr),
        }
    }

    /// Query listing the column names of table `$1`.
    pub fn columns_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT name FROM pragma_table_info($1)",
            Dialect::Postgres => {
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position"
            }
        }
    }
}

/// Where the view's `store` column comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreSource {
    Store,
    SourceId,
    Missing,
}

impl StoreSource {
    pub fn detect(item_columns: &[String]) -> Self {
        if has_column(item_columns, "store") {
            StoreSource::Store
        } else if has_column(item_columns, "source_id") {
            StoreSource::SourceId
        } else {
            StoreSource::Missing
        }
    }

    fn expr(&self, dialect: Dialect) -> String {
        match self {
            StoreSource::Store => dialect.as_text("i.store"),
            StoreSource::SourceId => {
                format!("'{}' || {}", SOURCE_PREFIX, dialect.as_text("i.source_id"))
            }
            StoreSource::Missing => dialect.as_text("NULL"),
        }
    }
}

/// Columns present on the three source tables.
#[derive(Debug, Clone, Default)]
pub struct InventorySchema {
    pub items: Vec<String>,
    pub products: Vec<String>,
    pub brands: Vec<String>,
}

impl InventorySchema {
    /// Tables with no columns at all, i.e. absent from the database.
    pub fn missing_tables(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.items.is_empty() {
            missing.push(ITEMS_TABLE);
        }
        if self.products.is_empty() {
            missing.push(PRODUCTS_TABLE);
        }
        if self.brands.is_empty() {
            missing.push(BRANDS_TABLE);
        }
        missing
    }

    pub fn store_source(&self) -> StoreSource {
        StoreSource::detect(&self.items)
    }
}

fn has_column(columns: &[String], name: &str) -> bool {
    columns.iter().any(|c| c.eq_ignore_ascii_case(name))
}

fn join_on(left: (&str, &[String]), right: (&str, &[String]), key: &str) -> String {
    if has_column(left.1, key) && has_column(right.1, key) {
        format!("{}.{} = {}.{}", left.0, key, right.0, key)
    } else {
        "1 = 0".to_string()
    }
}

/// Statements that (re)create [`INVENTORY_VIEW`] for `schema`.
pub fn inventory_view_sql(dialect: Dialect, schema: &InventorySchema) -> Vec<String> {
    let store = schema.store_source().expr(dialect);
    let product = coalesce_sql(dialect, "p", PRODUCT_NAME_COLUMNS, &schema.products);
    let brand = coalesce_sql(dialect, "b", BRAND_NAME_COLUMNS, &schema.brands);
    let quantity = if has_column(&schema.items, "quantity") {
        dialect.as_integer("i.quantity")
    } else {
        dialect.as_integer("NULL")
    };

    let item_side = ("i", schema.items.as_slice());
    let product_side = ("p", schema.products.as_slice());
    let brand_side = ("b", schema.brands.as_slice());

    let product_join = join_on(product_side, item_side, PRODUCT_KEY);
    let brand_join = if has_column(&schema.products, BRAND_KEY) {
        join_on(brand_side, product_side, BRAND_KEY)
    } else {
        join_on(brand_side, item_side, BRAND_KEY)
    };

    let create = format!(
        "CREATE VIEW {view} AS\n\
         SELECT\n    {store} AS store,\n    {product} AS product_name,\n    \
         {brand} AS brand_name,\n    {quantity} AS quantity\n\
         FROM {items} AS i\n\
         LEFT JOIN {products} AS p ON {product_join}\n\
         LEFT JOIN {brands} AS b ON {brand_join}",
        view = INVENTORY_VIEW,
        items = ITEMS_TABLE,
        products = PRODUCTS_TABLE,
        brands = BRANDS_TABLE,
    );

    vec![format!("DROP VIEW IF EXISTS {}", INVENTORY_VIEW), create]
}

/// Both spellings of a store reference: `2` matches `2` and `source_2`.
pub fn store_labels(store: &str) -> Vec<String> {
    let store = store.trim();
    match store.strip_prefix(SOURCE_PREFIX) {
        Some(raw) if !raw.is_empty() => vec![store.to_string(), raw.to_string()],
        _ => vec![store.to_string(), format!("{}{}", SOURCE_PREFIX, store)],
    }
}
