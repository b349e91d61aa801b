//! Model descriptors, handles, and the residency registry
//!
//! This module provides:
//! - The residency state machine per registered model
//! - The opaque model-handle contract the execution backend implements
//! - A registry with foreground loading, a background load queue, and
//!   usage accounting that protects resident models from eviction mid-use

pub mod descriptor;
pub mod handle;
pub mod registry;

pub use descriptor::{GenStats, ModelConfig, ModelDescriptor, ModelInfo, ResidencyState};
pub use handle::{
    ModelError, ModelHandle, ModelLoader, ModelResult, SimulatedLoader, SimulatedModel,
    TokenSender,
};
pub use registry::{ModelLease, ModelRegistry, RegistryError, RegistryResult};
