//! Rank-ordered deletion plans.

use std::collections::HashSet;

use crate::error::TeardownError;
use crate::resource::ManagedResource;

/// Resources sharing one rank. Members are independent of each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanGroup {
    rank: u32,
    resources: Vec<ManagedResource>,
}

impl PlanGroup {
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    #[must_use]
    pub fn resources(&self) -> &[ManagedResource] {
        &self.resources
    }
}

/// Groups of resources processed strictly in ascending rank order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionPlan {
    groups: Vec<PlanGroup>,
}

impl DeletionPlan {
    /// Build a plan from an unordered list of resources.
    ///
    /// Resources are grouped by rank; the relative order of resources within
    /// a rank is preserved.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] if the same resource appears twice.
    pub fn new(resources: Vec<ManagedResource>) -> Result<Self, TeardownError> {
        {
            let mut seen = HashSet::new();
            for resource in &resources {
                if !seen.insert(resource.identity()) {
                    return Err(TeardownError::Invalid(format!(
                        "{resource} appears more than once in the deletion plan"
                    )));
                }
            }
        }

        let mut sorted = resources;
        sorted.sort_by_key(ManagedResource::rank);

        let mut groups: Vec<PlanGroup> = Vec::new();
        for resource in sorted {
            match groups.last_mut() {
                Some(group) if group.rank == resource.rank() => group.resources.push(resource),
                _ => groups.push(PlanGroup {
                    rank: resource.rank(),
                    resources: vec![resource],
                }),
            }
        }

        Ok(Self { groups })
    }

    #[must_use]
    pub fn groups(&self) -> &[PlanGroup] {
        &self.groups
    }

    /// All resources in execution order.
    pub fn resources(&self) -> impl Iterator<Item = &ManagedResource> {
        self.groups.iter().flat_map(|g| g.resources.iter())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.resources.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
