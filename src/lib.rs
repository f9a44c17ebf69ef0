//! Budget Cache
//!
//! Offline-first client-side cache for the budgeting app.
//!
//! Layered architecture:
//! - domain: Budget entities and their payloads
//! - remote: Backing store interface and adapters
//! - registry: Stable keys for remote side effects
//! - store: Per-query entity cache
//! - mutation: Optimistic writes and the paused queue
//! - persist: Durable snapshot and resume
//! - commands / client: The surface a UI calls
//! - metrics: Balances and progress derived from cache contents

pub mod clock;
pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod mutation;
pub mod persist;
pub mod registry;
pub mod remote;
pub mod store;

mod client;

pub use client::{BudgetClient, Read, Startup};
pub use config::{CacheConfig, RemoteConfig};
pub use error::{CacheError, CacheResult};
pub use mutation::{MutationId, MutationOutcome, ResumeReport};
pub use persist::{HydrateReport, Inspection};
pub use store::{SlotKey, SlotStatus, SlotView};
