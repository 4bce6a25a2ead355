//! Import Coordination
//!
//! Durable progress flag, import state, item processing, the worker pool and
//! the UI connection handler.

pub mod connection;
pub mod flag;
pub mod processor;
pub mod progress;
pub mod state;

pub use connection::{
    ChannelPort, ConnectionState, ImportConnectionHandler, ImportJobState, ImportServices,
    MessagePort,
};
pub use flag::{ImportProgressFlag, IMPORTS_PROGRESS_KEY};
pub use processor::{ImportItemProcessor, MockItemProcessor};
pub use progress::{ChannelProgressObserver, ProgressEvent, ProgressManager, ProgressObserver};
pub use state::{ImportStateManager, InMemoryImportStateManager};
