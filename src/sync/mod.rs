//! Peer synchronization: connection state machine, per-transport workers,
//! retry and fallback, the durable outbox and request/response tracking.

pub mod backoff;
pub mod connector;
pub mod outbox;
pub mod state;
pub mod tasks;
pub mod worker;

pub use connector::{Connector, ConnectorStatus, Delivery};
pub use state::{ConnectionState, StateEvent};
pub use tasks::{Advance, PendingRequests, TaskHandle, TaskUpdate};
