//! Reconciliation
//!
//! Discovery of out-of-band storage objects, the eligibility gate, host
//! selection for discovery, and the import/unmanage flows.

pub mod agent;
pub mod eligibility;
pub mod host_selector;
pub mod manager;

pub use agent::{HttpHostAgent, StaticHostAgent, DEFAULT_AGENT_PORT};
pub use eligibility::Eligibility;
pub use host_selector::{select_host, HostSelector};
pub use manager::{ImportVolumeRequest, ReconciliationManager, UnmanagedVolume};
