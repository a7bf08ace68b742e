pub mod client;
pub mod error;
pub mod query;
pub mod retry;
pub mod traits;

pub use client::JellyfinClient;
pub use error::ApiError;
pub use query::{ItemQueryOpts, SortField, SortOrder};
pub use retry::RetryPolicy;
pub use traits::MediaServer;
