use chrono::{DateTime, Utc};
use jellyporter_models::ItemType;

use crate::error::ApiError;

pub const MIN_PAGE_SIZE: u32 = 25;
pub const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    DatePlayed,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::DatePlayed => "DatePlayed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "Ascending",
            SortOrder::Descending => "Descending",
        }
    }
}

/// Options for a paginated item listing. A set `since` turns the walk into a
/// delta query that terminates as soon as a page crosses the watermark.
#[derive(Debug, Clone)]
pub struct ItemQueryOpts {
    pub item_type: ItemType,
    pub limit: u32,
    pub start_index: u32,
    pub since: Option<DateTime<Utc>>,
    pub sort_by: Option<SortField>,
    pub sort_order: Option<SortOrder>,
}

impl ItemQueryOpts {
    /// A full catalog enumeration.
    pub fn full(item_type: ItemType, limit: u32) -> Self {
        Self {
            item_type,
            limit,
            start_index: 0,
            since: None,
            sort_by: None,
            sort_order: None,
        }
    }

    /// A delta walk bounded by `since`, newest playback first.
    pub fn delta(item_type: ItemType, limit: u32, since: DateTime<Utc>) -> Self {
        Self {
            item_type,
            limit,
            start_index: 0,
            since: Some(since),
            sort_by: Some(SortField::DatePlayed),
            sort_order: Some(SortOrder::Descending),
        }
    }

    pub fn is_delta(&self) -> bool {
        self.since.is_some()
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.limit < MIN_PAGE_SIZE || self.limit > MAX_PAGE_SIZE {
            return Err(ApiError::InvalidQueryOpts(format!(
                "limit must be within [{}, {}] but is {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.limit
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_bounds_are_enforced() {
        assert!(ItemQueryOpts::full(ItemType::Movie, 24).validate().is_err());
        assert!(ItemQueryOpts::full(ItemType::Movie, 25).validate().is_ok());
        assert!(ItemQueryOpts::full(ItemType::Movie, 1000).validate().is_ok());
        assert!(ItemQueryOpts::full(ItemType::Movie, 1001).validate().is_err());
    }

    #[test]
    fn delta_is_sorted_by_playback_date() {
        let opts = ItemQueryOpts::delta(ItemType::Episode, 25, Utc::now());
        assert!(opts.is_delta());
        assert_eq!(opts.sort_by, Some(SortField::DatePlayed));
        assert_eq!(opts.sort_order, Some(SortOrder::Descending));
    }
}
