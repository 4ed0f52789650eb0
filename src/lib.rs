// SPDX-License-Identifier: Apache-2.0

//! shq - named shared-memory queues for unrelated processes.
//!
//! A queue lives in a POSIX shared memory segment addressed by name.
//! Items are typed byte payloads removed destructively in FIFO order;
//! blocking variants, event subscriptions, expiration, and adaptive
//! LIFO congestion control are built in. Queue state survives process
//! crashes: the cross-process lock records its holder's pid and is
//! recovered from dead holders on contention.

pub mod config;
pub mod error;
pub mod queue;
pub mod registry;
mod shm;
pub mod types;

// Re-export commonly used types
pub use config::{Config, QueueSpec};
pub use error::{ConfigError, ShqError, ShqResult};
pub use queue::{Item, SharedQueue, SubItem, MAX_PAYLOAD_SIZE};
pub use registry::QueueRegistry;
pub use types::{Event, Mode, QueueName, TypeTag};
