use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{DependencyEdge, DeployContext, ResourceName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedResource {
    /// Position in the submission order, starting at 1.
    pub position: usize,
    pub name: ResourceName,
    pub kind: String,
    pub summary: String,
    pub depends_on: Vec<DependencyEdge>,
    pub warnings: Vec<String>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub stack: PathBuf,
    pub context: DeployContext,
    pub submission_order: Vec<ResourceName>,
    pub resources: Vec<PlannedResource>,
    pub exports: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl PlanReport {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
            || self
                .resources
                .iter()
                .any(|resource| !resource.warnings.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Realized,
    Failed,
    /// Never submitted because an upstream did not realize.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub name: ResourceName,
    pub kind: String,
    pub status: ResourceStatus,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
    pub blocked_by: Option<ResourceName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReport {
    pub stack: PathBuf,
    pub dry_run: bool,
    pub submission_order: Vec<ResourceName>,
    pub results: Vec<ResourceResult>,
    pub exports: BTreeMap<String, String>,
    pub errors: Vec<String>,
}

impl DeployReport {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
            || self
                .results
                .iter()
                .any(|result| result.status != ResourceStatus::Realized)
    }

    #[must_use]
    pub fn result(&self, name: &str) -> Option<&ResourceResult> {
        self.results
            .iter()
            .find(|result| result.name.as_str() == name)
    }
}
