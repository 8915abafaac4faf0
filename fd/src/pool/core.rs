//! ResourcePool - capability catalog, allocation, release, persistence
//!
//! The pool is the single owner of all [`Resource`]s and [`Allocation`]s.
//! Matching is deterministic: resources are considered in their persisted
//! order and ties break by insertion order. Every mutation is followed by
//! an atomic whole-file write of the pool snapshot; when that write fails
//! the in-memory mutation is reverted so memory and disk never diverge.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{
    Allocation, AllocationStatus, Capability, ReleaseReason, Requirement, Resource, ResourceStatus, ResourceType,
};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource {0} is not available (status {1:?})")]
    NotAvailable(String, ResourceStatus),

    #[error("no allocation for task {0}")]
    AllocationNotFound(String),
}

/// Result of a non-mutating requirement check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementCheck {
    pub satisfied: bool,
    /// Requirements that could not be matched (mandatory only)
    pub missing_resources: Vec<MissingRequirement>,
    /// Ids of resources that would satisfy the request
    pub available_resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingRequirement {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_level: Option<u8>,
}

/// Result of an allocation attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_resources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_resources: Option<Vec<MissingRequirement>>,
}

/// Aggregated pool status for reports and QUERY_CAPABILITIES
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatusReport {
    pub total: usize,
    pub available: usize,
    pub deployed: usize,
    pub busy: usize,
    pub error: usize,
    pub live_allocations: usize,
}

/// On-disk snapshot shape
#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolSnapshot {
    #[serde(default)]
    resources: Vec<Resource>,
    #[serde(default)]
    allocations: HashMap<String, Allocation>,
}

/// The file-backed resource pool
pub struct ResourcePool {
    resources: Vec<Resource>,
    allocations: HashMap<String, Allocation>,
    path: Option<PathBuf>,
}

impl ResourcePool {
    /// An in-memory pool (tests, dry runs)
    pub fn in_memory() -> Self {
        Self {
            resources: Vec::new(),
            allocations: HashMap::new(),
            path: None,
        }
    }

    /// Open or create the pool file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PoolError> {
        let path = path.into();
        let snapshot = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            PoolSnapshot::default()
        };
        info!(path = %path.display(), resources = snapshot.resources.len(), "ResourcePool::open");
        Ok(Self {
            resources: snapshot.resources,
            allocations: snapshot.allocations,
            path: Some(path),
        })
    }

    fn persist(&self) -> Result<(), PoolError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = PoolSnapshot {
            resources: self.resources.clone(),
            allocations: self.allocations.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_pool_file(path, &bytes)?;
        Ok(())
    }

    /// Run `mutate`, persist, and roll back the mutation when persistence
    /// fails so memory and disk stay consistent.
    fn mutate_persisted<T>(&mut self, mutate: impl FnOnce(&mut Self) -> T) -> Result<T, PoolError> {
        let resources_before = self.resources.clone();
        let allocations_before = self.allocations.clone();

        let out = mutate(self);
        if let Err(e) = self.persist() {
            warn!(error = %e, "ResourcePool: persist failed, reverting mutation");
            self.resources = resources_before;
            self.allocations = allocations_before;
            return Err(e);
        }
        Ok(out)
    }

    // === Catalog management ===

    pub fn add_resource(&mut self, resource: Resource) -> Result<String, PoolError> {
        let id = resource.id.clone();
        debug!(resource_id = %id, name = %resource.name, "ResourcePool::add_resource");
        self.mutate_persisted(|pool| pool.resources.push(resource))?;
        Ok(id)
    }

    /// Remove a resource; only `available` resources may be removed.
    pub fn remove_resource(&mut self, resource_id: &str) -> Result<(), PoolError> {
        let position = self
            .resources
            .iter()
            .position(|r| r.id == resource_id)
            .ok_or_else(|| PoolError::ResourceNotFound(resource_id.to_string()))?;

        let status = self.resources[position].status;
        if status != ResourceStatus::Available {
            return Err(PoolError::NotAvailable(resource_id.to_string(), status));
        }
        self.mutate_persisted(|pool| {
            pool.resources.remove(position);
        })
    }

    pub fn get_resource(&self, resource_id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == resource_id)
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn get_allocation(&self, task_id: &str) -> Option<&Allocation> {
        self.allocations.get(task_id)
    }

    /// Capability name -> resources carrying it, aggregated over every
    /// non-error resource.
    pub fn get_capability_catalog(&self) -> BTreeMap<String, Vec<(String, ResourceType, u8)>> {
        let mut catalog: BTreeMap<String, Vec<(String, ResourceType, u8)>> = BTreeMap::new();
        for resource in &self.resources {
            if resource.status == ResourceStatus::Error {
                continue;
            }
            for cap in &resource.capabilities {
                catalog
                    .entry(cap.name.clone())
                    .or_default()
                    .push((resource.id.clone(), resource.resource_type, cap.level));
            }
        }
        catalog
    }

    /// Resources that carry `capability` at or above `min_level`
    pub fn get_resources_by_capability(&self, capability: &str, min_level: u8) -> Vec<&Resource> {
        self.resources
            .iter()
            .filter(|r| r.status != ResourceStatus::Error)
            .filter(|r| r.capability_level(capability).is_some_and(|l| l >= min_level))
            .collect()
    }

    pub fn get_status_report(&self) -> PoolStatusReport {
        let count = |status: ResourceStatus| self.resources.iter().filter(|r| r.status == status).count();
        PoolStatusReport {
            total: self.resources.len(),
            available: count(ResourceStatus::Available),
            deployed: count(ResourceStatus::Deployed),
            busy: count(ResourceStatus::Busy),
            error: count(ResourceStatus::Error),
            live_allocations: self.allocations.values().filter(|a| !a.status.is_terminal()).count(),
        }
    }

    // === Matching ===

    /// Pick one resource per requirement without mutating anything.
    ///
    /// Matching per requirement: available resources of the same type,
    /// carrying every named capability, with no capability below
    /// `min_level`, excluding already-picked resources, first match in
    /// pool order wins.
    fn match_requirements(&self, requirements: &[Requirement]) -> (Vec<String>, Vec<MissingRequirement>) {
        let mut picked: Vec<String> = Vec::new();
        let mut picked_set: HashSet<String> = HashSet::new();
        let mut missing: Vec<MissingRequirement> = Vec::new();

        for req in requirements {
            let candidate = self.resources.iter().find(|r| {
                r.status == ResourceStatus::Available
                    && r.resource_type == req.resource_type
                    && !picked_set.contains(&r.id)
                    && req.capabilities.iter().all(|c| r.has_capability(c))
                    && req
                        .min_level
                        .is_none_or(|min| r.capabilities.iter().all(|c| c.level >= min))
            });

            match candidate {
                Some(resource) => {
                    picked_set.insert(resource.id.clone());
                    picked.push(resource.id.clone());
                }
                None if req.optional => {}
                None => missing.push(MissingRequirement {
                    resource_type: req.resource_type,
                    capability: req.capabilities.first().cloned(),
                    min_level: req.min_level,
                }),
            }
        }
        (picked, missing)
    }

    /// Non-mutating availability check
    pub fn check_resource_requirements(&self, requirements: &[Requirement]) -> RequirementCheck {
        let (picked, missing) = self.match_requirements(requirements);
        RequirementCheck {
            satisfied: missing.is_empty(),
            missing_resources: missing,
            available_resources: picked,
        }
    }

    // === Allocation lifecycle ===

    /// Allocate resources for a task. Idempotent: a task with a live
    /// allocation gets that allocation back unchanged. Atomic: either
    /// every mandatory requirement is matched and all chosen resources
    /// move to `deployed`, or nothing changes.
    pub fn allocate_resources(&mut self, task_id: &str, requirements: &[Requirement]) -> AllocationResult {
        if let Some(existing) = self.allocations.get(task_id)
            && !existing.status.is_terminal()
        {
            debug!(%task_id, "ResourcePool::allocate_resources: returning existing live allocation");
            return AllocationResult {
                success: true,
                allocated_resources: Some(existing.resource_ids.clone()),
                error: None,
                missing_resources: None,
            };
        }

        let (picked, missing) = self.match_requirements(requirements);
        if !missing.is_empty() {
            debug!(%task_id, missing = missing.len(), "ResourcePool::allocate_resources: shortage");
            return AllocationResult {
                success: false,
                allocated_resources: None,
                error: Some(format!(
                    "resource shortage: {} unsatisfied requirement(s)",
                    missing.len()
                )),
                missing_resources: Some(missing),
            };
        }

        let task = task_id.to_string();
        let picked_for_mutation = picked.clone();
        let mutated = self.mutate_persisted(move |pool| {
            for id in &picked_for_mutation {
                if let Some(resource) = pool.resources.iter_mut().find(|r| r.id == *id) {
                    resource.status = ResourceStatus::Deployed;
                    resource.current_task = Some(task.clone());
                    resource.deployment_count += 1;
                }
            }
            pool.allocations.insert(
                task.clone(),
                Allocation {
                    task_id: task.clone(),
                    resource_ids: picked_for_mutation.clone(),
                    status: AllocationStatus::Allocated,
                    allocated_at: chrono::Utc::now(),
                    released_at: None,
                    block_reason: None,
                },
            );
        });

        match mutated {
            Ok(()) => {
                info!(%task_id, count = picked.len(), "resources allocated");
                AllocationResult {
                    success: true,
                    allocated_resources: Some(picked),
                    error: None,
                    missing_resources: None,
                }
            }
            Err(e) => AllocationResult {
                success: false,
                allocated_resources: None,
                error: Some(format!("failed to persist allocation: {}", e)),
                missing_resources: None,
            },
        }
    }

    /// Allocate one specific resource to a task (single dispatch to a
    /// chosen resource). Same idempotence and atomicity as
    /// [`ResourcePool::allocate_resources`].
    pub fn allocate_named(&mut self, task_id: &str, resource_id: &str) -> AllocationResult {
        if let Some(existing) = self.allocations.get(task_id)
            && !existing.status.is_terminal()
        {
            return AllocationResult {
                success: true,
                allocated_resources: Some(existing.resource_ids.clone()),
                error: None,
                missing_resources: None,
            };
        }

        let available = self
            .resources
            .iter()
            .any(|r| r.id == resource_id && r.status == ResourceStatus::Available);
        if !available {
            return AllocationResult {
                success: false,
                allocated_resources: None,
                error: Some(format!("resource {} is not available", resource_id)),
                missing_resources: None,
            };
        }

        let task = task_id.to_string();
        let resource = resource_id.to_string();
        let mutated = self.mutate_persisted(move |pool| {
            if let Some(r) = pool.resources.iter_mut().find(|r| r.id == resource) {
                r.status = ResourceStatus::Deployed;
                r.current_task = Some(task.clone());
                r.deployment_count += 1;
            }
            pool.allocations.insert(
                task.clone(),
                Allocation {
                    task_id: task.clone(),
                    resource_ids: vec![resource.clone()],
                    status: AllocationStatus::Allocated,
                    allocated_at: chrono::Utc::now(),
                    released_at: None,
                    block_reason: None,
                },
            );
        });

        match mutated {
            Ok(()) => AllocationResult {
                success: true,
                allocated_resources: Some(vec![resource_id.to_string()]),
                error: None,
                missing_resources: None,
            },
            Err(e) => AllocationResult {
                success: false,
                allocated_resources: None,
                error: Some(format!("failed to persist allocation: {}", e)),
                missing_resources: None,
            },
        }
    }

    /// Move a task's allocation to `executing` and its resources to `busy`
    pub fn mark_task_executing(&mut self, task_id: &str) -> Result<(), PoolError> {
        if !self.allocations.contains_key(task_id) {
            return Err(PoolError::AllocationNotFound(task_id.to_string()));
        }
        let task = task_id.to_string();
        self.mutate_persisted(move |pool| {
            if let Some(allocation) = pool.allocations.get_mut(&task) {
                allocation.status = AllocationStatus::Executing;
                for id in allocation.resource_ids.clone() {
                    if let Some(resource) = pool.resources.iter_mut().find(|r| r.id == id) {
                        resource.status = ResourceStatus::Busy;
                    }
                }
            }
        })
    }

    /// Release a task's resources back to `available`, recording the
    /// terminal allocation status. An `error` release increments each
    /// resource's failure counter and records the reason.
    pub fn release_resources(&mut self, task_id: &str, reason: ReleaseReason) -> Result<Vec<String>, PoolError> {
        let allocation = self
            .allocations
            .get(task_id)
            .ok_or_else(|| PoolError::AllocationNotFound(task_id.to_string()))?;
        let released_ids = allocation.resource_ids.clone();

        let task = task_id.to_string();
        let reason_for_mutation = reason.clone();
        self.mutate_persisted(move |pool| {
            if let Some(allocation) = pool.allocations.get_mut(&task) {
                allocation.status = reason_for_mutation.terminal_status();
                allocation.released_at = Some(chrono::Utc::now());
                if let ReleaseReason::Blocked(why) = &reason_for_mutation {
                    allocation.block_reason = Some(why.clone());
                }
                for id in allocation.resource_ids.clone() {
                    if let Some(resource) = pool.resources.iter_mut().find(|r| r.id == id) {
                        resource.status = ResourceStatus::Available;
                        resource.current_task = None;
                        if let ReleaseReason::Error(why) = &reason_for_mutation {
                            resource.failure_count += 1;
                            resource.last_error = Some(why.clone());
                        }
                    }
                }
            }
        })?;

        info!(%task_id, count = released_ids.len(), ?reason, "resources released");
        Ok(released_ids)
    }

    /// Ids of resources currently available
    pub fn available_resource_ids(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| r.status == ResourceStatus::Available)
            .map(|r| r.id.clone())
            .collect()
    }
}

fn write_pool_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Convenience for seeding a default pool
pub fn default_executor(name: &str, capabilities: &[(&str, u8)]) -> Resource {
    Resource::new(
        name,
        ResourceType::Executor,
        capabilities.iter().map(|(n, l)| Capability::new(*n, *l)).collect(),
    )
}
