//! # DocDB Driver
//!
//! A replica-set aware driver for document databases speaking the legacy
//! binary wire protocol.
//!
//! ## Features
//!
//! - **Topology discovery** - Probes seeds, learns members from the primary
//!   and keeps the live server set current in the background
//! - **Connection multiplexing** - Many concurrent requests share one socket,
//!   correlated by request id
//! - **Session routing** - Consistency modes (strong, monotonic, eventual and
//!   read preferences) with socket pinning where ordering matters
//! - **Cursors** - Prefetching result iterators with limit and tailable support
//! - **Write concern** - Acknowledged writes batched with `getLastError`
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use docdb_driver::{Driver, FindOptions};
//! use bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = Driver::connect("mongodb://localhost:27017/shop").await?;
//!     let session = driver.session()?;
//!
//!     session
//!         .insert("shop.items", &[doc! { "name": "pen", "qty": 10 }])
//!         .await?;
//!
//!     let mut iter = session
//!         .find("shop.items", doc! {}, FindOptions::default().with_batch_size(100))
//!         .await?;
//!     while let Some(item) = iter.next_document().await? {
//!         println!("{}", item);
//!     }
//!
//!     session.close();
//!     driver.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use docdb_driver::{DriverConfig, Mode};
//! use std::time::Duration;
//!
//! let config = DriverConfig::builder("mongodb://a:27017,b:27017/?replicaSet=rs0")
//!     .unwrap()
//!     .with_mode(Mode::Nearest)
//!     .with_pool_limit(64)
//!     .with_sync_timeout(Duration::from_secs(10))
//!     .build();
//! assert_eq!(config.seeds.len(), 2);
//! ```
//!
//! ## Error Handling
//!
//! ```rust,no_run
//! # use docdb_driver::{Driver, DriverError};
//! # async fn example() {
//! match Driver::connect("mongodb://localhost").await {
//!     Ok(_) => println!("Connected!"),
//!     Err(DriverError::Unreachable(msg)) => eprintln!("no servers: {}", msg),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`driver`] - Cluster, sessions, sockets and cursors
//! - [`wire`] - Low-level frame codec

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod driver;
pub mod wire;

// Re-exports for convenience
pub use driver::{
    Cluster, Credential, Driver, DriverConfig, DriverConfigBuilder, DriverError, DriverMetrics,
    DriverResult, FindOptions, Iter, Mode, ServerAddress, Session, SessionConfig, WriteConcern,
};

pub use wire::{WireCodec, WireError};

/// Config alias for convenience
pub type Config = DriverConfig;
