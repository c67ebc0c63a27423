use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use caisson_domain::{
    DependencyEdge, DeployReport, PlanReport, PlannedResource, ResourceKind, ResourceName,
    ResourceSpec, StackSpec, SubstitutionTable,
};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::graph::{build_submission_order, dependency_edges, verify_trace};
use crate::provisioner::{KubectlEngine, ProvisioningEngine, RecordingEngine, TraceEvent};
use crate::sequencer::deploy;
use crate::stack_lua::evaluate_stack;
use crate::template::{absent_tokens, sha256_bytes};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct DeployOptions {
    /// Realize against the in-memory recording engine instead of a cluster.
    pub dry_run: bool,
    /// Upper bound for each external command, including rollout waits.
    pub timeout: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Evaluate a stack file.
///
/// # Errors
///
/// Returns an error when the stack file cannot be read or evaluated.
pub fn load_stack(path: &Path) -> Result<(StackSpec, BTreeSet<String>), PipelineError> {
    evaluate_stack(path).map_err(PipelineError::from)
}

fn summarize(resource: &ResourceSpec) -> String {
    match &resource.kind {
        ResourceKind::Image(image) => {
            let mut summary = format!("{}:{}", image.repository, image.tag);
            if let Some(platform) = &image.platform {
                summary.push_str(&format!(" ({platform})"));
            }
            if let Some(context) = &image.context {
                summary.push_str(&format!(" built from {}", context.display()));
            }
            summary
        }
        ResourceKind::Database(database) => format!(
            "{} database {} as {} on port {}",
            database.engine, database.db_name, database.username, database.port
        ),
        ResourceKind::Secret(secret) => {
            let keys: Vec<&str> = secret.data.keys().map(String::as_str).collect();
            format!("keys {}", keys.join(", "))
        }
        ResourceKind::Manifest(manifest) => format!(
            "{} with {} substitution(s)",
            manifest.template.display(),
            manifest.substitutions.len()
        ),
        ResourceKind::Autoscaler(autoscaler) => format!(
            "Deployment/{} {}..{} replicas at {}% cpu",
            autoscaler.target,
            autoscaler.min_replicas,
            autoscaler.max_replicas,
            autoscaler.cpu_utilization
        ),
    }
}

fn transitive_upstreams<'a>(
    name: &'a ResourceName,
    edges: &'a [DependencyEdge],
) -> BTreeSet<&'a ResourceName> {
    let mut seen = BTreeSet::new();
    let mut pending = vec![name];
    while let Some(next) = pending.pop() {
        for edge in edges.iter().filter(|edge| &edge.consumer == next) {
            if seen.insert(&edge.upstream) {
                pending.push(&edge.upstream);
            }
        }
    }
    seen
}

/// Lint one resource; returns its warnings and, for manifests, the template hash.
fn inspect(
    stack: &StackSpec,
    resource: &ResourceSpec,
    edges: &[DependencyEdge],
) -> (Vec<String>, Option<String>) {
    match &resource.kind {
        ResourceKind::Manifest(manifest) => {
            let source = match fs::read_to_string(&manifest.template) {
                Ok(source) => source,
                Err(error) => {
                    return (
                        vec![format!(
                            "template {} cannot be read: {error}",
                            manifest.template.display()
                        )],
                        None,
                    );
                }
            };

            let table: SubstitutionTable = manifest
                .substitutions
                .iter()
                .map(|(token, value)| (token.clone(), value.to_string()))
                .collect();
            let warnings = absent_tokens(&source, &table)
                .into_iter()
                .map(|token| {
                    format!(
                        "placeholder \"{token}\" does not occur in {}",
                        manifest.template.display()
                    )
                })
                .collect();
            (warnings, Some(sha256_bytes(source.as_bytes())))
        }
        ResourceKind::Autoscaler(autoscaler) => {
            let upstreams = transitive_upstreams(&resource.name, edges);
            let target_is_upstream = upstreams.iter().any(|upstream| {
                upstream.as_str() == autoscaler.target
                    && stack
                        .resource(upstream.as_str())
                        .is_some_and(|spec| matches!(spec.kind, ResourceKind::Manifest(_)))
            });
            if target_is_upstream {
                (Vec::new(), None)
            } else {
                (
                    vec![format!(
                        "target workload {} is not an upstream manifest; the autoscaler may be submitted before it exists",
                        autoscaler.target
                    )],
                    None,
                )
            }
        }
        ResourceKind::Image(_) | ResourceKind::Database(_) | ResourceKind::Secret(_) => {
            (Vec::new(), None)
        }
    }
}

/// Build the plan for a stack: submission order, wait edges, and lint
/// warnings. A broken dependency graph is reported in `errors` while the
/// report stays renderable.
#[must_use]
pub fn build_plan(stack: &StackSpec) -> PlanReport {
    let edges = dependency_edges(stack);
    let mut errors = Vec::new();
    let order = match build_submission_order(stack) {
        Ok(order) => order,
        Err(error) => {
            errors.push(error.to_string());
            let mut fallback: Vec<ResourceName> = stack
                .resources
                .iter()
                .map(|resource| resource.name.clone())
                .collect();
            fallback.sort();
            fallback
        }
    };

    let by_name: HashMap<&ResourceName, &ResourceSpec> = stack
        .resources
        .iter()
        .map(|resource| (&resource.name, resource))
        .collect();

    let mut resources = Vec::with_capacity(order.len());
    for (index, name) in order.iter().enumerate() {
        let Some(resource) = by_name.get(name) else {
            continue;
        };
        let (warnings, content_hash) = inspect(stack, resource, &edges);
        resources.push(PlannedResource {
            position: index + 1,
            name: name.clone(),
            kind: resource.kind.label().to_string(),
            summary: summarize(resource),
            depends_on: edges
                .iter()
                .filter(|edge| &edge.consumer == name)
                .cloned()
                .collect(),
            warnings,
            content_hash,
        });
    }

    let mut warnings = Vec::new();
    if stack.resources.is_empty() {
        warnings.push("stack declares no resources".to_string());
    }

    PlanReport {
        stack: stack.path.clone(),
        context: stack.context.clone(),
        submission_order: order,
        resources,
        exports: stack
            .exports
            .iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .collect(),
        warnings,
        errors,
    }
}

/// Evaluate a stack file and plan it.
///
/// # Errors
///
/// Returns an error when the stack file cannot be read or evaluated.
pub fn build_plan_for_stack(path: &Path) -> Result<(PlanReport, BTreeSet<String>), PipelineError> {
    let (stack, sensitive) = load_stack(path)?;
    Ok((build_plan(&stack), sensitive))
}

/// Evaluate a stack file and run the deployment pass against it.
///
/// # Errors
///
/// Returns an error when the stack cannot be evaluated, its dependency graph
/// is invalid, or the provisioning engine cannot be set up.
pub async fn deploy_stack(
    path: &Path,
    options: DeployOptions,
) -> Result<(DeployReport, BTreeSet<String>), PipelineError> {
    let (stack, sensitive) = load_stack(path)?;
    info!(
        stack = %stack.path.display(),
        dry_run = options.dry_run,
        "deploying stack"
    );

    let mut report = if options.dry_run {
        let recorder = Arc::new(RecordingEngine::new(&stack.context));
        let mut report = deploy(&stack, Arc::clone(&recorder) as Arc<dyn ProvisioningEngine>).await?;
        record_trace_violations(&mut report, &recorder.trace(), &dependency_edges(&stack));
        report
    } else {
        let engine = Arc::new(KubectlEngine::new(&stack.context, options.timeout)?);
        deploy(&stack, engine).await?
    };
    report.dry_run = options.dry_run;
    Ok((report, sensitive))
}

/// Check a recorded trace against the dependency edges of the deployed stack.
fn record_trace_violations(
    report: &mut DeployReport,
    trace: &[TraceEvent],
    edges: &[DependencyEdge],
) {
    if let Err(violation) = verify_trace(trace, edges) {
        warn!(%violation, "recorded trace violates a dependency edge");
        report.errors.push(violation.to_string());
    }
}
