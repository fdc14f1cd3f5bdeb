/// Certificate management: ACME dns-01 issuance, the challenge publisher
/// and the store-backed issuance lock.
pub mod challenge;
pub mod lock;
pub mod manager;

pub use challenge::{Dns01Publisher, PROPAGATION_DELAY};
pub use lock::{LockHandle, StoreLock};
pub use manager::{CertData, CertManager};
