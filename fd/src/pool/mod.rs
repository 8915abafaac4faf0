//! Capability-based resource pool: catalog, matching, allocation,
//! release, and file persistence.

mod core;
mod inference;
mod types;

pub use core::{
    AllocationResult, MissingRequirement, PoolError, PoolStatusReport, RequirementCheck, ResourcePool,
    default_executor,
};
pub use inference::{CapabilityRule, default_rules, infer_requirements};
pub use types::{
    Allocation, AllocationStatus, Capability, ReleaseReason, Requirement, Resource, ResourceStatus, ResourceType,
};
