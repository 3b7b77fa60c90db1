//! # trackrelay-core
//!
//! Core library for trackrelay - an offline-resilient analytics event relay.
//!
//! This library provides:
//! - Domain types for queued event records and inbound messages
//! - A durable SQLite-backed event queue
//! - The delivery pipeline (immediate send, queue fallback, ordered resend)
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through three stages:
//! - **Submit:** one immediate delivery attempt to `{base_endpoint}/{tag}`
//! - **Queue:** failed events are persisted and a sync is registered
//! - **Drain:** on the `tracking-sync` signal, queued events are resent
//!   oldest-first, stopping at the first failure; records older than the
//!   retention window are swept out
//!
//! ## Example
//!
//! ```rust,no_run
//! use trackrelay_core::{Config, Relay};
//!
//! # async fn run() -> trackrelay_core::Result<()> {
//! let config = Config::load()?;
//! let relay = Relay::from_config(&config)?;
//! relay.activate().await;
//! relay
//!     .handle_line(r#"{"type":"track","trackingData":{"event":"signup"}}"#)
//!     .await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use delivery::{DeliveryPipeline, DeliveryStats, DrainReport, RetryTrigger};
pub use error::{Error, Result};
pub use queue::{EventQueue, QueueStore};
pub use relay::{MessageOutcome, Relay};
pub use types::*;

// Public modules
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod queue;
pub mod relay;
pub mod source;
pub mod types;
