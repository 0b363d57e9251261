//! # cachegate
//!
//! A caching reverse proxy. Requests are forwarded to a single origin; `GET`
//! responses for configured paths are kept in a persistent store for a fixed
//! TTL and served from there until they expire.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cachegate::{CacheStore, ProxyConfig, ProxyHandler, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::from_json(r#"{
//!         "remote_url": "http://127.0.0.1:9000",
//!         "cacheable_paths": ["/assets/*"]
//!     }"#)?;
//!     config.validate()?;
//!
//!     let server = Server::bind(config.bind_addr()).await?;
//!     let handler = Arc::new(ProxyHandler::new(config, CacheStore::in_memory())?);
//!     handler.serve(server, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache;
pub mod config;
pub mod http;
pub mod proxy;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use background::{ExpirySweeper, SweepReport};
pub use cache::{CacheEntry, CacheKey, CacheRuleSet, CacheStore};
pub use config::{ConfigError, ProxyConfig, StoreEngine};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{CacheStatus, ProxyHandler};
pub use server::{Server, ServerError};
