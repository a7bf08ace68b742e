/// Versioned schema migrations, embedded at compile time. A migration's
/// version is its 1-based position; the latest schema version is the number
/// of embedded files. Files are applied by [`crate::store::Store`] inside one
/// transaction per step, which also rewrites the single-row `schema_version`
/// table.
pub const MIGRATIONS: &[&str] = &[
    include_str!("../migrations/0001_schema.sql"),
    include_str!("../migrations/0002_changelog.sql"),
];

pub fn latest_version() -> i64 {
    MIGRATIONS.len() as i64
}
