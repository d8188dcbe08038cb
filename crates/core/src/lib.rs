pub mod account;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod logging;
pub mod protocol;
pub mod transport;
pub mod ui;

pub use connection::{Connection, ConnectionFlags, ConnectionId, ConnectionManager, ConnectionState};
pub use error::{ErrorInfo, ErrorKind, EventBusError, PurpleError, Result};
pub use event::{BroadcastEventBus, Event, EventBus, EventPayload, EventSource};
