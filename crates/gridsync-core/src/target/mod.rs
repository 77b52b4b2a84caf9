//! Target side of replication
//!
//! - [`TargetGroup`]: attachment slot of one group, enforcing the attach policy
//! - [`TargetChannel`]: in-order consumption, replay, transactions and bulks
//! - [`TargetSession`]: frame handler for one connection epoch

pub mod channel;
pub mod group;
pub mod session;

pub use channel::{TargetChannel, TargetChannelStats};
pub use group::{SharedChannel, TargetGroup};
pub use session::{TargetSession, reject};
