use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-user playback state attached to an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserData {
    pub playback_position_ticks: i64,
    pub played_percentage: f64,
    pub play_count: i32,
    pub is_favorite: bool,
    pub last_played_date: Option<DateTime<Utc>>,
    pub played: bool,
}

impl UserData {
    /// Unix seconds of the last playback, `0` when the item was never played.
    pub fn watched_date_unix(&self) -> i64 {
        self.last_played_date.map(|ts| ts.timestamp()).unwrap_or(0)
    }
}

/// Body of `POST /Users/{userId}/Items/{itemId}/UserData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserDataUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
    pub playback_position_ticks: Option<i64>,
    pub played_percentage: Option<f64>,
    pub play_count: i32,
    pub last_played_date: DateTime<Utc>,
    pub played: bool,
}
