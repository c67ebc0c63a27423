#![allow(clippy::expect_used)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use caisson_domain::{ResourceName, ResourceStatus, StackSpec};

use super::deploy;
use crate::error::GraphError;
use crate::graph::{dependency_edges, verify_trace};
use crate::provisioner::{RecordingEngine, TraceEvent, TracePhase};
use crate::stack_lua::evaluate_stack;

const ECR: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com";

const STACK: &str = r#"
stack { name = "app", cluster = "app-cluster", region = "us-east-1" }

local registry = "123456789012.dkr.ecr.us-east-1.amazonaws.com"
image("backend-image", { repository = registry .. "/backend-repo", platform = "linux/amd64" })
image("frontend-image", { repository = registry .. "/frontend-repo", platform = "linux/amd64" })

database("mysql-db", { db_name = "appdb", username = "admin", password = "Admin12345!" })

secret("db-connection", {
  data = {
    DB_HOST = ref("mysql-db", "address"),
    DB_USER = ref("mysql-db", "username"),
    DB_PASSWORD = "Admin12345!",
    DB_NAME = ref("mysql-db", "db_name"),
  },
})

manifest("backend", "backend.yaml", {
  substitutions = { ["local/backend:latest"] = ref("backend-image", "image_name") },
  depends_on = { "db-connection" },
})
manifest("frontend", "frontend.yaml", {
  substitutions = { ["local/frontend:latest"] = ref("frontend-image", "image_name") },
  depends_on = { "backend" },
})
autoscaler("backend-hpa", { target = "backend", max_replicas = 5, depends_on = { "frontend" } })

export("rds_endpoint", ref("mysql-db", "address"))
export("backend_repo", ref("backend-image", "repository"))
"#;

const BACKEND: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: backend\nspec:\n  template:\n    spec:\n      containers:\n        - name: backend\n          image: local/backend:latest\n";
const FRONTEND: &str = "image: local/frontend:latest\n";

fn fixture(dir: &Path) -> StackSpec {
    fs::write(dir.join("stack.lua"), STACK).expect("write stack");
    fs::write(dir.join("backend.yaml"), BACKEND).expect("write backend");
    fs::write(dir.join("frontend.yaml"), FRONTEND).expect("write frontend");
    let (stack, _) = evaluate_stack(&dir.join("stack.lua")).expect("evaluate stack");
    stack
}

fn name(value: &str) -> ResourceName {
    ResourceName::try_from(value).expect("name")
}

fn sequence_of(trace: &[TraceEvent], resource: &str, phase: TracePhase) -> u64 {
    trace
        .iter()
        .find(|event| event.resource.as_str() == resource && event.phase == phase)
        .map(|event| event.sequence)
        .expect("event present")
}

fn submitted(trace: &[TraceEvent], resource: &str) -> bool {
    trace
        .iter()
        .any(|event| event.resource.as_str() == resource && event.phase == TracePhase::Submitted)
}

#[tokio::test(start_paused = true)]
async fn submits_secret_backend_frontend_autoscaler_in_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let stack = fixture(temp.path());
    let engine = Arc::new(
        RecordingEngine::new(&stack.context)
            .with_delay(name("db-connection"), Duration::from_millis(30))
            .with_delay(name("backend"), Duration::from_millis(20))
            .with_delay(name("frontend"), Duration::from_millis(10)),
    );

    let report = deploy(&stack, engine.clone()).await.expect("deploy");
    assert!(!report.has_failures(), "{report:?}");

    let trace = engine.trace();
    let at = |resource, phase| sequence_of(&trace, resource, phase);
    assert!(at("db-connection", TracePhase::Realized) < at("backend", TracePhase::Submitted));
    assert!(at("backend", TracePhase::Realized) < at("frontend", TracePhase::Submitted));
    assert!(at("frontend", TracePhase::Realized) < at("backend-hpa", TracePhase::Submitted));
    assert!(at("backend-image", TracePhase::Realized) < at("backend", TracePhase::Submitted));
    verify_trace(&trace, &dependency_edges(&stack)).expect("trace respects edges");

    assert_eq!(
        report.exports.get("rds_endpoint").map(String::as_str),
        Some("mysql-db.us-east-1.db.invalid")
    );
    assert_eq!(
        report.exports.get("backend_repo"),
        Some(&format!("{ECR}/backend-repo"))
    );
}

#[tokio::test]
async fn manifests_and_secret_receive_resolved_values() {
    let temp = tempfile::tempdir().expect("tempdir");
    let stack = fixture(temp.path());
    let engine = Arc::new(RecordingEngine::new(&stack.context));

    let report = deploy(&stack, engine.clone()).await.expect("deploy");
    assert!(!report.has_failures(), "{report:?}");

    let backend = engine.rendered("backend").expect("backend rendered");
    assert!(!backend.contains("local/backend:latest"));
    assert_eq!(
        backend,
        BACKEND.replace("local/backend:latest", &format!("{ECR}/backend-repo:latest"))
    );
    assert_eq!(
        engine.rendered("frontend").as_deref(),
        Some(format!("image: {ECR}/frontend-repo:latest\n").as_str())
    );

    let secret = engine.rendered("db-connection").expect("secret rendered");
    assert!(secret.contains("mysql-db.us-east-1.db.invalid"), "{secret}");
    assert!(secret.contains("appdb"), "{secret}");

    let backend_result = report.result("backend").expect("backend result");
    assert_eq!(backend_result.outputs.get("objects").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn failed_image_skips_only_its_dependents() {
    let temp = tempfile::tempdir().expect("tempdir");
    let stack = fixture(temp.path());
    let engine = Arc::new(RecordingEngine::new(&stack.context).fail_on(name("backend-image")));

    let report = deploy(&stack, engine.clone()).await.expect("deploy");
    assert!(report.has_failures());

    let status = |resource: &str| report.result(resource).map(|result| result.status);
    assert_eq!(status("backend-image"), Some(ResourceStatus::Failed));
    assert_eq!(status("backend"), Some(ResourceStatus::Skipped));
    assert_eq!(status("frontend"), Some(ResourceStatus::Skipped));
    assert_eq!(status("backend-hpa"), Some(ResourceStatus::Skipped));
    assert_eq!(status("db-connection"), Some(ResourceStatus::Realized));
    assert_eq!(status("frontend-image"), Some(ResourceStatus::Realized));

    let frontend = report.result("frontend").expect("frontend result");
    assert_eq!(frontend.blocked_by, Some(name("backend-image")));

    let trace = engine.trace();
    assert!(!submitted(&trace, "backend"));
    assert!(!submitted(&trace, "backend-hpa"));
    assert!(report.exports.contains_key("rds_endpoint"));
    assert!(!report.exports.contains_key("backend_repo"));
    assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn missing_template_fails_the_manifest() {
    let temp = tempfile::tempdir().expect("tempdir");
    let stack = fixture(temp.path());
    fs::remove_file(temp.path().join("frontend.yaml")).expect("remove template");
    let engine = Arc::new(RecordingEngine::new(&stack.context));

    let report = deploy(&stack, engine.clone()).await.expect("deploy");

    let frontend = report.result("frontend").expect("frontend result");
    assert_eq!(frontend.status, ResourceStatus::Failed);
    let error = frontend.error.as_deref().expect("error recorded");
    assert!(error.contains("not found"), "{error}");

    let hpa = report.result("backend-hpa").expect("hpa result");
    assert_eq!(hpa.status, ResourceStatus::Skipped);
    assert_eq!(hpa.blocked_by, Some(name("frontend")));
    assert_eq!(
        report.result("backend").map(|result| result.status),
        Some(ResourceStatus::Realized)
    );
    assert!(!submitted(&engine.trace(), "frontend"));
}

#[tokio::test(start_paused = true)]
async fn independent_resources_do_not_wait_on_each_other() {
    let temp = tempfile::tempdir().expect("tempdir");
    let stack = fixture(temp.path());
    let engine = Arc::new(
        RecordingEngine::new(&stack.context)
            .with_delay(name("frontend-image"), Duration::from_millis(100)),
    );

    let report = deploy(&stack, engine.clone()).await.expect("deploy");
    assert!(!report.has_failures(), "{report:?}");

    let trace = engine.trace();
    assert!(
        sequence_of(&trace, "backend", TracePhase::Realized)
            < sequence_of(&trace, "frontend-image", TracePhase::Realized)
    );
}

#[tokio::test]
async fn invalid_graph_submits_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut stack = fixture(temp.path());
    for resource in &mut stack.resources {
        if resource.name.as_str() == "db-connection" {
            resource.depends_on.push(name("backend-hpa"));
        }
    }
    let engine = Arc::new(RecordingEngine::new(&stack.context));

    let error = deploy(&stack, engine.clone())
        .await
        .expect_err("cycle must fail");
    assert!(matches!(error, GraphError::CycleDetected { .. }), "{error}");
    assert!(engine.trace().is_empty());
}
