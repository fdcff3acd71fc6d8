//! Relays transit arrivals, stops and routes from a OneBusAway-style HTTP
//! API to a memory-constrained peer device, one acknowledged message at a
//! time.

pub mod arrivals;
pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod link;
pub mod location;
pub mod logging;
pub mod message;
pub mod oba_types;
pub mod state;
pub mod status;
pub mod stops;

pub use config::RelayConfig;
pub use dispatch::Coordinator;
pub use state::{RelayState, TransactionId};
