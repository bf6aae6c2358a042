//! Storage Control Plane
//!
//! Everything that sits between callers and the lifecycle engines: backend
//! adapters and their registry, naming of physical objects, the volume
//! orchestrator, and reconciliation of out-of-band objects.

pub mod backends;
pub mod inventory;
pub mod naming;
pub mod orchestrator;
pub mod reconcile;

pub use backends::{BackendConfig, BackendFactory, BackendRegistry};
pub use inventory::StaticInventory;
pub use orchestrator::*;
pub use reconcile::*;
