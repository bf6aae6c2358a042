//! Storage Lifecycle - Resource Lifecycle Engine for a Storage Control Plane
//!
//! Persisted state machines for volumes, snapshots and file shares, the
//! adapter contract through which they drive storage arrays, and the
//! reconciliation flows that import and release out-of-band objects.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                 Callers                                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │     Volume Orchestrator     │  │      Reconciliation Manager         │   │
//! │  │ (create/resize/snapshot/..) │  │  (discover / import / unmanage)     │   │
//! │  └──────┬───────────────┬──────┘  └──────┬───────────────────┬──────────┘   │
//! │         │ start/exit    │ adapter call   │ adopt/retire      │ discovery    │
//! │         ▼ events        ▼                ▼                   ▼              │
//! │  ┌─────────────────┐  ┌───────────────┐  ┌─────────────┐  ┌─────────────┐   │
//! │  │ State Machine   │  │   Backend     │  │  Eligibility│  │ Host Agent  │   │
//! │  │ Engines + Tables│  │   Registry    │  │  Gate       │  │ + Selector  │   │
//! │  └────────┬────────┘  └───────┬───────┘  └─────────────┘  └─────────────┘   │
//! │           │ CAS on sequence   │ StorageAdapter                              │
//! │           ▼                   ▼                                             │
//! │  ┌─────────────────┐  ┌───────────────────────────────────────────────┐     │
//! │  │  Entity Store + │  │  Storage arrays (SimulatedArray reference)    │     │
//! │  │  Tenant Ledger  │  │                                               │     │
//! │  └─────────────────┘  └───────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engines never call an adapter; only the orchestrator and the
//! reconciliation manager cross that boundary.
//!
//! # Modules
//!
//! - [`fsm`]: Transition tables, the generic engine and transition listeners
//! - [`domain`]: Lifecycle entities, boundary types and ports
//! - [`store`]: Persistence and tenant accounting collaborators
//! - [`controlplane`]: Backends, naming, orchestrator and reconciliation
//! - [`config`]: YAML configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod fsm;
pub mod store;

// Re-export commonly used types
pub use config::ControlPlaneConfig;

pub use controlplane::{
    AllocateVolumeRequest, BackendConfig, BackendFactory, BackendRegistry, DriftReport,
    ImportVolumeRequest, OrchestratorConfig, ReconciliationManager, StaticInventory,
    UnmanagedVolume, VolumeOrchestrator,
};

pub use domain::{
    EntityKind, FileShare, FileShareEvent, FileShareState, LifecycleEntity, Owner, Snapshot,
    SnapshotEvent, SnapshotState, StorageAdapter, Volume, VolumeEvent, VolumeState,
};

pub use error::{Error, ErrorAction, Result};

pub use fsm::{LifecycleEngines, LifecycleTables, StateMachine, TransitionTable};

pub use store::{EntityStore, MemoryDatabase, ResourceAccounting, ResourceType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
