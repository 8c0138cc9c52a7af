//! Fleet state shared by the daemon: account health, the task store and its
//! state machine, delegation depth enforcement, SLA escalation, work
//! sessions, trust records and the message inbox.
//!
//! Nothing in this crate touches sockets; the node wraps each store in its
//! own lock.

pub mod delegation;
pub mod error;
pub mod friction;
pub mod health;
pub mod inbox;
pub mod sla;
pub mod state_dir;
pub mod store;
pub mod task;
pub mod trust;
pub mod work_session;

pub use error::FleetError;
