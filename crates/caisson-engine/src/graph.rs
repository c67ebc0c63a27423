use std::collections::{BTreeMap, BTreeSet, HashMap};

use caisson_domain::{DependencyEdge, EdgeKind, OutputRef, ResourceName, StackSpec};

use crate::error::{DependencyViolation, GraphError};
use crate::provisioner::{TraceEvent, TracePhase};

/// Every wait edge of the stack: explicit `depends_on` entries plus one edge
/// per upstream whose outputs a resource reads.
#[must_use]
pub fn dependency_edges(stack: &StackSpec) -> Vec<DependencyEdge> {
    let mut edges = BTreeSet::new();

    for resource in &stack.resources {
        for upstream in &resource.depends_on {
            edges.insert(DependencyEdge {
                consumer: resource.name.clone(),
                upstream: upstream.clone(),
                kind: EdgeKind::Declared,
            });
        }
        for reference in resource.kind.references() {
            edges.insert(DependencyEdge {
                consumer: resource.name.clone(),
                upstream: reference.resource.clone(),
                kind: EdgeKind::Reference,
            });
        }
    }

    edges.into_iter().collect()
}

fn check_reference(
    stack: &StackSpec,
    consumer: &str,
    reference: &OutputRef,
    missing: &mut Vec<String>,
) -> Result<(), GraphError> {
    let Some(upstream) = stack.resource(reference.resource.as_str()) else {
        missing.push(format!(
            "{consumer} reads {reference} from missing resource {}",
            reference.resource
        ));
        return Ok(());
    };

    let fields = upstream.kind.output_fields();
    if fields.contains(&reference.field.as_str()) {
        return Ok(());
    }

    Err(GraphError::UnknownOutput {
        consumer: consumer.to_string(),
        reference: reference.to_string(),
        kind: upstream.kind.label(),
        available: fields.join(", "),
    })
}

/// Build a dependency-respecting submission order using topological sorting.
///
/// Resources that become ready together are ordered by name.
///
/// # Errors
///
/// Returns an error when a dependency or reference points to a missing
/// resource, when a reference names an output field the upstream does not
/// expose, or when a dependency cycle is detected.
pub fn build_submission_order(stack: &StackSpec) -> Result<Vec<ResourceName>, GraphError> {
    if stack.resources.is_empty() {
        return Ok(Vec::new());
    }

    let mut indegree: HashMap<ResourceName, usize> = HashMap::new();
    let mut adjacency: HashMap<ResourceName, Vec<ResourceName>> = HashMap::new();

    for resource in &stack.resources {
        indegree.entry(resource.name.clone()).or_insert(0);
        adjacency.entry(resource.name.clone()).or_default();
    }

    let mut missing = Vec::new();
    for resource in &stack.resources {
        for reference in resource.kind.references() {
            check_reference(stack, resource.name.as_str(), reference, &mut missing)?;
        }
    }
    for (export, value) in &stack.exports {
        if let Some(reference) = value.output_ref() {
            check_reference(stack, &format!("export {export}"), reference, &mut missing)?;
        }
    }

    let mut seen_pairs = BTreeSet::new();
    for edge in dependency_edges(stack) {
        if !indegree.contains_key(&edge.upstream) {
            if edge.kind == EdgeKind::Declared {
                missing.push(format!(
                    "{} depends on missing resource {}",
                    edge.consumer, edge.upstream
                ));
            }
            continue;
        }
        if !seen_pairs.insert((edge.consumer.clone(), edge.upstream.clone())) {
            continue;
        }

        adjacency
            .entry(edge.upstream.clone())
            .or_default()
            .push(edge.consumer.clone());

        let Some(entry) = indegree.get_mut(&edge.consumer) else {
            return Err(GraphError::Invariant {
                message: format!("internal graph error: missing indegree for {}", edge.consumer),
            });
        };
        *entry += 1;
    }

    if !missing.is_empty() {
        let details = missing.join("\n  - ");
        return Err(GraphError::MissingNodes { details });
    }

    let mut ready = BTreeSet::new();
    for (name, count) in &indegree {
        if *count == 0 {
            ready.insert(name.clone());
        }
    }

    let mut order = Vec::with_capacity(stack.resources.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.clone());

        if let Some(neighbors) = adjacency.get(&next) {
            for neighbor in neighbors {
                let Some(entry) = indegree.get_mut(neighbor) else {
                    return Err(GraphError::Invariant {
                        message: "internal graph error: missing neighbor indegree".to_string(),
                    });
                };

                if *entry == 0 {
                    continue;
                }

                *entry -= 1;
                if *entry == 0 {
                    ready.insert(neighbor.clone());
                }
            }
        }
    }

    if order.len() != stack.resources.len() {
        let mut leftovers: Vec<_> = indegree
            .iter()
            .filter_map(|(name, count)| if *count > 0 { Some(name.clone()) } else { None })
            .collect();
        leftovers.sort();
        let cycle = leftovers
            .into_iter()
            .map(|name| name.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        return Err(GraphError::CycleDetected { cycle });
    }

    Ok(order)
}

/// Check an engine trace against the wait edges: every submitted consumer
/// must come after a realization of each of its upstreams.
///
/// # Errors
///
/// Returns the first edge whose consumer was submitted before its upstream
/// was realized.
pub fn verify_trace(
    trace: &[TraceEvent],
    edges: &[DependencyEdge],
) -> Result<(), DependencyViolation> {
    let mut submitted: BTreeMap<&ResourceName, u64> = BTreeMap::new();
    let mut realized: BTreeMap<&ResourceName, u64> = BTreeMap::new();
    for event in trace {
        let slot = match event.phase {
            TracePhase::Submitted => &mut submitted,
            TracePhase::Realized => &mut realized,
            TracePhase::Failed => continue,
        };
        slot.entry(&event.resource).or_insert(event.sequence);
    }

    for edge in edges {
        let Some(submitted_at) = submitted.get(&edge.consumer) else {
            continue;
        };
        match realized.get(&edge.upstream) {
            Some(realized_at) if realized_at < submitted_at => {}
            _ => {
                return Err(DependencyViolation {
                    consumer: edge.consumer.clone(),
                    upstream: edge.upstream.clone(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use caisson_domain::{
        AutoscalerSpec, DependencyEdge, DeployContext, EdgeKind, ImageSpec, ManifestSpec,
        OutputRef, PlaceholderToken, ResourceKind, ResourceName, ResourceSpec, SecretSpec,
        StackSpec, ValueSource,
    };

    use super::{build_submission_order, dependency_edges, verify_trace};
    use crate::error::GraphError;
    use crate::provisioner::{TraceEvent, TracePhase};

    fn name(value: &str) -> ResourceName {
        ResourceName::try_from(value).expect("name")
    }

    fn reference(resource: &str, field: &str) -> ValueSource {
        ValueSource::Ref(OutputRef {
            resource: name(resource),
            field: field.to_string(),
        })
    }

    fn image(resource: &str) -> ResourceSpec {
        ResourceSpec::new(
            name(resource),
            ResourceKind::Image(ImageSpec {
                repository: format!("registry.example/{resource}"),
                tag: "latest".to_string(),
                context: None,
                platform: None,
            }),
        )
    }

    fn manifest(resource: &str, image: &str, depends_on: &[&str]) -> ResourceSpec {
        let mut substitutions = BTreeMap::new();
        substitutions.insert(
            PlaceholderToken::try_from(format!("local/{resource}:latest")).expect("token"),
            reference(image, "image_name"),
        );
        let mut spec = ResourceSpec::new(
            name(resource),
            ResourceKind::Manifest(ManifestSpec {
                template: PathBuf::from(format!("/tmp/{resource}.yaml")),
                substitutions,
            }),
        );
        spec.depends_on = depends_on.iter().map(|value| name(value)).collect();
        spec
    }

    fn stack(resources: Vec<ResourceSpec>) -> StackSpec {
        StackSpec {
            path: PathBuf::from("/tmp/stack.lua"),
            context: DeployContext {
                stack: "app".to_string(),
                cluster: "app-cluster".to_string(),
                region: "us-east-1".to_string(),
                namespace: "default".to_string(),
                kubeconfig: None,
            },
            resources,
            exports: BTreeMap::new(),
        }
    }

    fn app_stack() -> StackSpec {
        let mut data = BTreeMap::new();
        data.insert("DB_USER".to_string(), ValueSource::literal("admin"));
        let secret = ResourceSpec::new(name("db-connection"), ResourceKind::Secret(SecretSpec { data }));
        let mut hpa = ResourceSpec::new(
            name("backend-hpa"),
            ResourceKind::Autoscaler(AutoscalerSpec {
                target: "backend".to_string(),
                min_replicas: 1,
                max_replicas: 5,
                cpu_utilization: 50,
            }),
        );
        hpa.depends_on = vec![name("frontend")];

        stack(vec![
            hpa,
            manifest("frontend", "frontend-image", &["backend"]),
            manifest("backend", "backend-image", &["db-connection"]),
            secret,
            image("frontend-image"),
            image("backend-image"),
        ])
    }

    #[test]
    fn collects_declared_and_reference_edges() {
        let edges = dependency_edges(&app_stack());

        assert!(edges.contains(&DependencyEdge {
            consumer: name("backend"),
            upstream: name("db-connection"),
            kind: EdgeKind::Declared,
        }));
        assert!(edges.contains(&DependencyEdge {
            consumer: name("backend"),
            upstream: name("backend-image"),
            kind: EdgeKind::Reference,
        }));
        assert_eq!(edges.len(), 5);
    }

    #[test]
    fn orders_secret_backend_frontend_autoscaler() {
        let order = build_submission_order(&app_stack()).expect("order");
        let position = |resource: &str| {
            order
                .iter()
                .position(|entry| entry.as_str() == resource)
                .expect("present")
        };

        assert!(position("db-connection") < position("backend"));
        assert!(position("backend-image") < position("backend"));
        assert!(position("backend") < position("frontend"));
        assert!(position("frontend") < position("backend-hpa"));
        assert_eq!(order.len(), 6);
        assert_eq!(order[0], name("backend-image"));
    }

    #[test]
    fn detects_cycle() {
        let resources = vec![
            manifest("backend", "backend-image", &["frontend"]),
            manifest("frontend", "frontend-image", &["backend"]),
            image("backend-image"),
            image("frontend-image"),
        ];

        let err = build_submission_order(&stack(resources)).expect_err("must fail");
        assert!(matches!(err, GraphError::CycleDetected { .. }), "{err}");
        assert!(err.to_string().contains("backend -> frontend"), "{err}");
    }

    #[test]
    fn reports_missing_upstreams() {
        let resources = vec![manifest("backend", "backend-image", &["db-connection"])];

        let err = build_submission_order(&stack(resources)).expect_err("must fail");
        let message = err.to_string();
        assert!(message.contains("missing resource db-connection"), "{message}");
        assert!(message.contains("backend-image.image_name"), "{message}");
    }

    #[test]
    fn rejects_unknown_output_fields() {
        let resources = vec![
            manifest("backend", "backend-image", &[]),
            image("backend-image"),
        ];
        let mut stack = stack(resources);
        stack
            .exports
            .insert("backend_repo".to_string(), reference("backend-image", "url"));

        let err = build_submission_order(&stack).expect_err("must fail");
        assert!(matches!(err, GraphError::UnknownOutput { .. }), "{err}");
        assert!(err.to_string().contains("image_name, repository, tag"), "{err}");
    }

    fn event(sequence: u64, resource: &str, phase: TracePhase) -> TraceEvent {
        TraceEvent {
            sequence,
            resource: name(resource),
            phase,
        }
    }

    #[test]
    fn verify_trace_accepts_realized_before_submitted() {
        let edges = vec![DependencyEdge {
            consumer: name("backend"),
            upstream: name("db-connection"),
            kind: EdgeKind::Declared,
        }];
        let trace = vec![
            event(0, "db-connection", TracePhase::Submitted),
            event(1, "db-connection", TracePhase::Realized),
            event(2, "backend", TracePhase::Submitted),
            event(3, "backend", TracePhase::Realized),
        ];

        verify_trace(&trace, &edges).expect("ordered trace");
    }

    #[test]
    fn verify_trace_rejects_early_submission() {
        let edges = vec![DependencyEdge {
            consumer: name("frontend"),
            upstream: name("backend"),
            kind: EdgeKind::Declared,
        }];
        let trace = vec![
            event(0, "backend", TracePhase::Submitted),
            event(1, "frontend", TracePhase::Submitted),
            event(2, "backend", TracePhase::Realized),
        ];

        let violation = verify_trace(&trace, &edges).expect_err("must fail");
        assert_eq!(violation.consumer, name("frontend"));
        assert_eq!(violation.upstream, name("backend"));
    }
}
