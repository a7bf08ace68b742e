pub mod migrations;
pub mod store;

pub use store::{ChangelogEntry, LibraryStore, StaleItem, Store, StoreError};
