//! # PendingDNS
//!
//! API-driven authoritative DNS server with a Redis-backed zone store.
//! Three tightly coupled subsystems share that store:
//!
//! - **DNS responder**: UDP + TCP listeners serving A/AAAA/CNAME/MX/TXT/
//!   CAA/NS/SOA plus the ANAME and URL pseudo-records, with wildcard
//!   fallback and health-aware answers
//! - **Public HTTP/HTTPS endpoint**: serves URL records as redirects or a
//!   reverse proxy, obtaining TLS certificates on demand through ACME
//!   dns-01 challenges published into this server's own zones
//! - **Health checker**: probes A/AAAA endpoints over tcp/tcps/http/https
//!   and feeds the results back into query resolution
//!
//! The REST management API, CLI tooling and process supervisor are
//! external collaborators; they consume the re-exported types below.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pendingdns::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pendingdns::Result<()> {
//!     let config = Arc::new(Config::default());
//!     let store = Arc::new(RedisStore::connect(&config.redis.url).await?);
//!     let zones = Arc::new(ZoneStore::new(store.clone()));
//!
//!     let records = zones.list("example.com").await?;
//!     println!("{} records", records.len());
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod acme;
pub mod config;
pub mod dns;
pub mod error;
pub mod health;
pub mod resolver;
pub mod store;
pub mod web;
pub mod zone;

// Re-exports for convenience
pub use acme::{CertData, CertManager, Dns01Publisher, StoreLock};
pub use config::Config;
pub use dns::{DnsHandler, serve_tcp, serve_udp};
pub use error::{DnsError, Result};
pub use health::HealthChecker;
pub use resolver::{CachedResolver, ResolveOpts};
pub use store::{KeyStore, MemoryStore, RedisStore};
pub use web::{PublicState, TlsManager, serve_http, serve_https};
pub use zone::{HealthState, RecordType, RecordValue, ZoneRecord, ZoneStore};

/// Commonly used types
pub mod prelude {
    pub use crate::acme::{CertData, CertManager};
    pub use crate::config::Config;
    pub use crate::dns::DnsHandler;
    pub use crate::error::{DnsError, Result};
    pub use crate::health::HealthChecker;
    pub use crate::resolver::CachedResolver;
    pub use crate::store::{KeyStore, MemoryStore, RedisStore};
    pub use crate::zone::{RecordType, RecordValue, ZoneRecord, ZoneStore};
}
