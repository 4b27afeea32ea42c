//! Hot-swappable logic module.
//!
//! - `capability` — the capability traits and `CapabilitySet`
//! - `module` — immutable `LogicModule` snapshot + content hashing
//! - `store` — on-disk storage and atomic swap of the current module
//! - `manifest` — HTTP manifest compiler shipped by the coordinator

pub mod capability;
pub mod manifest;
pub mod module;
pub mod store;

pub use capability::{
    BatchProcessor, Capability, CapabilitySet, Credentials, InventoryLister, LoginOutcome,
    LoginVerifier, MeterLookup, MeterVerifier, ProgressSink, ProgressUpdate,
};
pub use manifest::ManifestCompiler;
pub use module::{LogicModule, ModuleCompiler, compute_hash};
pub use store::LogicStore;
