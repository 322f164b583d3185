//! # haystack-client
//!
//! Watch subsystem of a client for tag-based record servers.
//!
//! A watch is a live interest in a set of record ids. The server only offers
//! coarse, rate-limited subscription calls (open, add, remove, poll, close),
//! so this crate multiplexes any number of application watches onto one
//! subscription:
//!
//! - watches made in the same scheduler turn share one network open/add
//! - ids are reference counted, only the last release reaches the network
//! - one poll loop per subscription, rescheduled after each completed poll
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use haystack_client::{ClientConfig, WatchService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new()?.validate()?;
//!     let service = WatchService::builder(apis).set_config(config.watch).build()?;
//!
//!     let (ahu, meters) = tokio::join!(
//!         service.make("ahu", ["ahu-1", "ahu-2"], None),
//!         service.make("meters", ["meter-1"], None),
//!     );
//!     let ahu = ahu?;
//!     let mut updates = ahu.updates();
//!     updates.changed().await?;
//!     println!("{:?}", ahu.grid()?);
//!
//!     service.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! The network side is supplied by implementing [`WatchApis`].

mod config;
mod errors;
mod grid;
mod ids;
mod utils;
mod watch;

pub use config::*;
pub use errors::*;
pub use grid::*;
pub use ids::*;
pub use watch::*;

#[cfg(test)]
mod test_utils;
