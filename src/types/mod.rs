//! Types
//!
//! Data structures shared by the token manager and the import coordinator.

pub mod config;
pub mod import;
pub mod message;
pub mod token;

pub use config::*;
pub use import::*;
pub use message::*;
pub use token::*;
