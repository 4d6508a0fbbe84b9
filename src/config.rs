//! Daemon configuration: TOML file parsing and the bespoke duration/size
//! grammars used by `precache.*`/`httpd.*` keys.

pub mod precache;
pub mod units;

pub use precache::Config;
