//! Token Management
//!
//! Token persistence and the access token lifecycle.

pub mod manager;
pub mod storage;

pub use manager::{DefaultTokenManager, TokenManager};
pub use storage::{KeyValueTokenStore, MockTokenStore, TokenStore};
