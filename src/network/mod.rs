//! Remote-write delivery
//!
//! - [`NetworkManager`]: routes records to shard loops by label hash and
//!   rebuilds the loops when the connection configuration changes
//! - `SendLoop`: one shard's accumulate / send / retry worker
//! - [`wire`]: protobuf request construction
//! - [`retry`]: response classification and `Retry-After` handling

mod manager;
pub mod retry;
mod send_loop;
pub mod wire;

pub use manager::{shard_index, NetworkManager};
pub use retry::{RetryReason, SendOutcome};
