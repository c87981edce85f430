//! Fixed catalog queries behind the metadata routes.

/// Lists every catalog on the server. Always run against the default database.
pub const DATABASES_QUERY: &str = "select [CATALOG_NAME] from $SYSTEM.DBSCHEMA_CATALOGS";

/// Lists user tables in the current catalog.
pub const TABLES_QUERY: &str =
    "select TABLE_NAME from $SYSTEM.DBSCHEMA_TABLES where TABLE_SCHEMA <> '$SYSTEM'";

/// Longest quoted identifier accepted, quotes included.
pub const MAX_QUOTED_NAME: usize = 1024;

/// Wrap `identifier` in single quotes, doubling embedded quotes.
///
/// Returns `None` when the quoted form would exceed [`MAX_QUOTED_NAME`] characters.
pub fn quote_name(identifier: &str) -> Option<String> {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('\'');
    for c in identifier.chars() {
        if c == '\'' {
            quoted.push_str("''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');

    (quoted.chars().count() <= MAX_QUOTED_NAME).then_some(quoted)
}

/// `evaluate('<table>')`, or `None` for an identifier that cannot be quoted.
pub fn table_query(table: &str) -> Option<String> {
    quote_name(table).map(|name| format!("evaluate({name})"))
}
