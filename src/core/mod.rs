//! Core Infrastructure
//!
//! HTTP transport and key-value persistence.

pub mod storage;
pub mod transport;

pub use storage::{InMemoryKeyValueStore, JsonFileKeyValueStore, KeyValueStore};
pub use transport::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, MockHttpTransport, ReqwestHttpTransport,
};
