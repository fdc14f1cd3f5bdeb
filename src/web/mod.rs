/// Public HTTP/HTTPS server: URL record redirects/proxying and the TLS
/// machinery behind the SNI callback.
pub mod server;
pub mod tls;

pub use server::{PublicState, build_router, serve_http, serve_https};
pub use tls::{ClusterSessionStore, TlsManager};
