use serde::{Deserialize, Serialize};
use std::fmt;

use crate::user_data::UserData;

/// The two item kinds whose user-data is reconciled. The string form is what
/// the Jellyfin API expects in `IncludeItemTypes` and what the store uses to
/// key per-type state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    Movie,
    Episode,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Movie => "Movie",
            ItemType::Episode => "Episode",
        }
    }

    /// Lowercased form used as a metrics label value.
    pub fn metric_label(&self) -> &'static str {
        match self {
            ItemType::Movie => "movie",
            ItemType::Episode => "episode",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single movie or episode as returned by a Jellyfin server. Responses
/// carry many more fields; everything not consumed is ignored and every
/// consumed field is defaulted so sparse items still decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Item {
    pub name: String,
    pub server_id: String,
    pub id: String,
    pub user_data: UserData,
    pub provider_ids: ProviderIds,
    #[serde(rename = "Type")]
    pub item_type: String,
    pub series_name: String,
    pub series_id: String,
    pub season_id: String,
    pub season_name: String,
    #[serde(rename = "RunTimeTicks")]
    pub runtime: i64,
}

/// External provider identifiers. Jellyfin returns these as free-form
/// strings; sanitization to numeric ids happens at the store boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProviderIds {
    pub imdb: Option<String>,
    pub tmdb: Option<String>,
    pub tvdb: Option<String>,
}

/// One page of `/Users/{id}/Items`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ItemsPage {
    pub items: Vec<Item>,
    pub total_record_count: usize,
    pub start_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_decodes_without_user_data_or_provider_ids() {
        let item: Item = serde_json::from_str(r#"{"Name": "The Matrix", "Id": "abc"}"#).unwrap();
        assert_eq!(item.name, "The Matrix");
        assert_eq!(item.user_data.watched_date_unix(), 0);
        assert!(item.provider_ids.imdb.is_none());
    }

    #[test]
    fn item_decodes_jellyfin_casing() {
        let raw = r#"{
            "Name": "Pilot",
            "Id": "ep1",
            "ServerId": "srv",
            "Type": "Episode",
            "SeriesName": "Some Show",
            "SeasonName": "Season 1",
            "RunTimeTicks": 12000000000,
            "ProviderIds": {"Imdb": "tt0903747", "Tvdb": "349232"},
            "UserData": {"PlayedPercentage": 97.5, "Played": true,
                         "LastPlayedDate": "2025-06-15T15:00:00Z"}
        }"#;
        let item: Item = serde_json::from_str(raw).unwrap();
        assert_eq!(item.series_name, "Some Show");
        assert_eq!(item.runtime, 12_000_000_000);
        assert_eq!(item.provider_ids.tvdb.as_deref(), Some("349232"));
        assert!(item.user_data.watched_date_unix() > 0);
    }
}
