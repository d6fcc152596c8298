//! Server configuration files.

mod blocklist;
mod card_config;
mod ini;

pub use blocklist::DeviceBlocklist;
pub use card_config::CardConfig;
pub use ini::IniFile;
