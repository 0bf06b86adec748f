//! Node registry and heartbeat.
//!
//! Tracks the nodes participating in replication, their RPC endpoints,
//! init state, and liveness. Registration happens by self-heartbeat and by
//! peer `SyncNodeMetadata` pushes; a periodic sweeper derives liveness
//! from heartbeat recency and re-runs coordinator election.

mod store;
mod tasks;

pub use store::{Node, RegistryError, RegistryStore};
pub use tasks::{HeartbeatTask, LivenessThresholds, SweeperTask};
