//! Display-name resolution for products and brands.
//!
//! Imported catalogues fill name columns inconsistently, so both the view SQL
//! and reply formatting walk the same priority list. Blank values count as
//! absent at every level.

use crate::schema::Dialect;

/// Product name columns, highest priority first.
pub const PRODUCT_NAME_COLUMNS: &[&str] = &[
    "consumer_product_name",
    "product_name",
    "short_name",
    "fanciful_name",
];

/// Brand name columns, highest priority first.
pub const BRAND_NAME_COLUMNS: &[&str] = &["consumer_brand_name", "brand_name", "short_name"];

pub const UNKNOWN_NAME: &str = "Unknown";

/// First non-blank candidate, trimmed, or [`UNKNOWN_NAME`].
pub fn resolve_name<'a, I>(candidates: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_NAME)
        .to_string()
}

/// Resolve a name from a row accessor, walking `columns` in priority order.
pub fn resolve_with<F>(columns: &[&str], mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let values: Vec<Option<String>> = columns.iter().map(|c| lookup(c)).collect();
    resolve_name(values.iter().map(|v| v.as_deref()))
}

/// SQL expression implementing the same rule as [`resolve_name`].
///
/// Only candidates present in `available` are referenced, so the expression
/// stays valid against tables that lack some of the name columns. With no
/// candidate present the expression is the literal `'Unknown'`.
pub fn coalesce_sql(
    dialect: Dialect,
    alias: &str,
    candidates: &[&str],
    available: &[String],
) -> String {
    let parts: Vec<String> = candidates
        .iter()
        .filter(|c| available.iter().any(|a| a.eq_ignore_ascii_case(c)))
        .map(|c| {
            let column = dialect.as_text(&format!("{}.{}", alias, c));
            format!("NULLIF({}, '')", dialect.trim(&column))
        })
        .collect();

    if parts.is_empty() {
        format!("'{}'", UNKNOWN_NAME)
    } else {
        format!("COALESCE({}, '{}')", parts.join(", "), UNKNOWN_NAME)
    }
}
