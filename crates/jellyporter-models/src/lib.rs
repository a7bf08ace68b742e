pub mod item;
pub mod user;
pub mod user_data;

pub use item::{Item, ItemType, ItemsPage, ProviderIds};
pub use user::User;
pub use user_data::{UserData, UserDataUpdate};
