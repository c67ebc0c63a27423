use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use caisson_domain::{
    DeployReport, ResourceKind, ResourceName, ResourceResult, ResourceSpec,
    ResourceStatus, StackSpec, SubstitutionTable, ValueSource,
};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{EngineError, GraphError, Unresolved};
use crate::graph::{build_submission_order, dependency_edges};
use crate::output::Output;
use crate::provisioner::{ProvisioningEngine, Submission};
use crate::template::materialize;

/// Output fields of a realized resource.
pub type Outputs = BTreeMap<String, String>;

type Upstreams = BTreeMap<ResourceName, Outputs>;

fn lookup(upstreams: &Upstreams, value: &ValueSource) -> Result<String, Unresolved> {
    let output = match value {
        ValueSource::Literal { value } => return Ok(value.clone()),
        ValueSource::Ref(output) => output,
    };

    upstreams
        .get(&output.resource)
        .and_then(|fields| fields.get(&output.field))
        .cloned()
        .ok_or_else(|| Unresolved {
            origin: output.resource.clone(),
            reason: format!("output {output} was not produced"),
        })
}

async fn realize(
    resource: &ResourceSpec,
    namespace: &str,
    upstreams: &Upstreams,
    engine: &dyn ProvisioningEngine,
) -> Result<Outputs, Unresolved> {
    let name = &resource.name;
    let failed = |error: EngineError| Unresolved {
        origin: name.clone(),
        reason: error.to_string(),
    };

    let submission = match &resource.kind {
        ResourceKind::Image(spec) => {
            let image = engine.build_image(name, spec).await.map_err(failed)?;
            let mut outputs = Outputs::new();
            outputs.insert("image_name".to_string(), image.to_string());
            outputs.insert("repository".to_string(), image.repository_url());
            outputs.insert("tag".to_string(), image.tag().to_string());
            return Ok(outputs);
        }
        ResourceKind::Database(spec) => {
            let endpoint = engine
                .provision_database(name, spec)
                .await
                .map_err(failed)?;
            let mut outputs = Outputs::new();
            outputs.insert("address".to_string(), endpoint.address);
            outputs.insert("port".to_string(), endpoint.port.to_string());
            outputs.insert("username".to_string(), spec.username.clone());
            outputs.insert("db_name".to_string(), spec.db_name.clone());
            return Ok(outputs);
        }
        ResourceKind::Secret(spec) => {
            let mut data = BTreeMap::new();
            for (key, value) in &spec.data {
                data.insert(key.clone(), lookup(upstreams, value)?);
            }
            Submission::Secret {
                name: name.clone(),
                namespace: namespace.to_string(),
                data,
            }
        }
        ResourceKind::Manifest(spec) => {
            let mut substitutions = SubstitutionTable::new();
            for (token, value) in &spec.substitutions {
                substitutions.insert(token.clone(), lookup(upstreams, value)?);
            }
            let manifest = materialize(&spec.template, &substitutions)
                .map_err(|error| failed(EngineError::from(error)))?;
            Submission::Manifest {
                name: name.clone(),
                namespace: namespace.to_string(),
                manifest,
            }
        }
        ResourceKind::Autoscaler(spec) => Submission::Autoscaler {
            name: name.clone(),
            namespace: namespace.to_string(),
            spec: spec.clone(),
        },
    };

    let realized = engine.submit(submission).await.map_err(failed)?;
    Ok(realized.outputs)
}

async fn realize_when_ready(
    resource: ResourceSpec,
    namespace: String,
    upstream_names: Vec<ResourceName>,
    ready: Output<Vec<Outputs>>,
    engine: Arc<dyn ProvisioningEngine>,
) -> Result<Outputs, Unresolved> {
    if !upstream_names.is_empty() {
        debug!(
            resource = %resource.name,
            upstreams = upstream_names.len(),
            "waiting on upstreams"
        );
    }
    let values = ready.resolve().await?;
    let upstreams: Upstreams = upstream_names.into_iter().zip(values).collect();

    debug!(resource = %resource.name, kind = resource.kind.label(), "submitting");
    realize(&resource, &namespace, &upstreams, engine.as_ref()).await
}

fn resource_output(
    resource: &ResourceSpec,
    namespace: &str,
    upstreams: Vec<(ResourceName, Output<Outputs>)>,
    engine: Arc<dyn ProvisioningEngine>,
) -> Output<Outputs> {
    let (names, outputs): (Vec<_>, Vec<_>) = upstreams.into_iter().unzip();
    let ready = Output::all(outputs);
    let mut resources: BTreeSet<ResourceName> = ready.resources().clone();
    resources.insert(resource.name.clone());

    Output::from_future(
        resources,
        realize_when_ready(
            resource.clone(),
            namespace.to_string(),
            names,
            ready,
            engine,
        ),
    )
}

fn settle(resource: &ResourceSpec, result: Result<Outputs, Unresolved>) -> ResourceResult {
    let name = resource.name.clone();
    let kind = resource.kind.label().to_string();
    match result {
        Ok(outputs) => {
            info!(resource = %name, kind = %kind, "realized");
            ResourceResult {
                name,
                kind,
                status: ResourceStatus::Realized,
                outputs,
                error: None,
                blocked_by: None,
            }
        }
        Err(error) if error.origin == name => {
            warn!(resource = %name, kind = %kind, reason = %error.reason, "failed");
            ResourceResult {
                name,
                kind,
                status: ResourceStatus::Failed,
                outputs: Outputs::new(),
                error: Some(error.reason),
                blocked_by: None,
            }
        }
        Err(error) => {
            warn!(resource = %name, blocked_by = %error.origin, "skipped");
            ResourceResult {
                name,
                kind,
                status: ResourceStatus::Skipped,
                outputs: Outputs::new(),
                error: Some(error.to_string()),
                blocked_by: Some(error.origin),
            }
        }
    }
}

fn resolve_exports(
    stack: &StackSpec,
    results: &[ResourceResult],
) -> (BTreeMap<String, String>, Vec<String>) {
    let upstreams: Upstreams = results
        .iter()
        .filter(|result| result.status == ResourceStatus::Realized)
        .map(|result| (result.name.clone(), result.outputs.clone()))
        .collect();

    let mut exports = BTreeMap::new();
    let mut errors = Vec::new();
    for (export, value) in &stack.exports {
        match lookup(&upstreams, value) {
            Ok(resolved) => {
                exports.insert(export.clone(), resolved);
            }
            Err(error) => errors.push(format!("export {export} is unavailable: {error}")),
        }
    }
    (exports, errors)
}

/// Realize every resource of `stack`, each as soon as all of its upstreams
/// are realized.
///
/// Every resource is driven concurrently on the calling task. A resource
/// whose upstream failed is never submitted and is reported as skipped;
/// resources that do not depend on the failure still proceed.
///
/// # Errors
///
/// Returns an error when the dependency graph is invalid. Nothing is
/// submitted in that case.
pub async fn deploy(
    stack: &StackSpec,
    engine: Arc<dyn ProvisioningEngine>,
) -> Result<DeployReport, GraphError> {
    let order = build_submission_order(stack)?;
    let edges = dependency_edges(stack);

    let mut built: BTreeMap<ResourceName, Output<Outputs>> = BTreeMap::new();
    let mut ordered = Vec::with_capacity(order.len());
    for name in &order {
        let Some(resource) = stack.resource(name.as_str()) else {
            return Err(GraphError::Invariant {
                message: format!("internal graph error: ordered resource {name} is not declared"),
            });
        };

        let upstream_names: BTreeSet<&ResourceName> = edges
            .iter()
            .filter(|edge| &edge.consumer == name)
            .map(|edge| &edge.upstream)
            .collect();
        let mut upstreams = Vec::with_capacity(upstream_names.len());
        for upstream in upstream_names {
            let Some(output) = built.get(upstream) else {
                return Err(GraphError::Invariant {
                    message: format!(
                        "internal graph error: {upstream} is not ordered before {name}"
                    ),
                });
            };
            upstreams.push((upstream.clone(), output.clone()));
        }

        let output = resource_output(
            resource,
            &stack.context.namespace,
            upstreams,
            Arc::clone(&engine),
        );
        built.insert(name.clone(), output.clone());
        ordered.push((resource, output));
    }

    info!(
        stack = %stack.context.stack,
        resources = ordered.len(),
        "starting deployment"
    );
    let settled = join_all(ordered.iter().map(|(_, output)| output.resolve())).await;

    let results: Vec<ResourceResult> = ordered
        .iter()
        .zip(settled)
        .map(|((resource, _), result)| settle(resource, result))
        .collect();
    let (exports, errors) = resolve_exports(stack, &results);

    Ok(DeployReport {
        stack: stack.path.clone(),
        dry_run: false,
        submission_order: order,
        results,
        exports,
        errors,
    })
}

#[cfg(test)]
mod tests;
