//! # Fleet State
//!
//! Inbound half of the core: every message delivered on the subscribed filters
//! goes through [`router::TopicRouter`], which classifies it, hands device
//! mutations to [`tracker::DeviceStateTracker`] and appends one audit entry.
//!
//! ```text
//! broker ──► TopicRouter ──► DeviceStateTracker ──► devices
//!                 │
//!                 └──────────► message log (IN)
//! ```

pub mod router;
pub mod tracker;

pub use router::{classify, Classification, RouteOutcome, TopicRouter};
pub use tracker::{DeviceStateTracker, UpdateOutcome};
