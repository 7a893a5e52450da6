//! Session connections: registry, reconnect policy, sweeping, login waits.

pub mod backoff;
pub mod manager;
pub mod record;
pub mod scheduler;
pub mod sweeper;
pub mod waiter;

pub use backoff::ReconnectPolicy;
pub use manager::{ConnectionManager, ManagerOptions};
pub use record::QrCallback;
pub use sweeper::{SweepPolicy, Sweeper};
pub use waiter::await_login;
