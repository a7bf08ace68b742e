use async_trait::async_trait;
use jellyporter_models::{ItemsPage, UserDataUpdate};

use crate::error::ApiError;
use crate::query::ItemQueryOpts;

/// The capability set the reconciliation engine needs from one media server.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// The id of the configured user, resolved once and cached.
    async fn user_id(&self) -> Result<String, ApiError>;

    /// All items matching `opts`, paginated transparently. A delta query
    /// stops walking as soon as a page crosses the watermark.
    async fn items(&self, user_id: &str, opts: &ItemQueryOpts) -> Result<ItemsPage, ApiError>;

    /// Replace the user-data of a single item.
    async fn update_user_data(
        &self,
        user_id: &str,
        item_id: &str,
        update: &UserDataUpdate,
    ) -> Result<(), ApiError>;
}
