use serde::{Deserialize, Serialize};

/// A user entry from `GET /Users`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct User {
    pub name: String,
    pub server_id: String,
    pub id: String,
}
