//! wgplane Common Library
//!
//! Shared types, the configuration store, the state cache, and WireGuard
//! key/config helpers.

pub mod cache;
pub mod error;
pub mod store;
pub mod types;
pub mod wg;

// Re-export commonly used types
pub use cache::{MemoryCache, RedisCache, StateCache};
pub use error::{Error, Result};
pub use store::{ConfigStore, NewInterface};
pub use types::*;

/// wgplane version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wgplane")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
