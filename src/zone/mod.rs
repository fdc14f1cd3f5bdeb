/// Zone store: naming scheme, record model and record lifecycle.
pub mod name;
pub mod record;
pub mod store;

pub use record::{CaaTag, HealthState, RecordType, RecordValue, ZoneRecord};
pub use store::{HEALTH_QUEUE_KEY, HEALTH_RESULTS_KEY, ZoneStore, health_member};
