/// Authoritative DNS: the query handler and the UDP/TCP listeners.
pub mod handler;
pub mod server;

pub use handler::DnsHandler;
pub use server::{serve_tcp, serve_udp};
