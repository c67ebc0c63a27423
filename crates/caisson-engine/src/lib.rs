mod error;
mod fs_util;
mod graph;
mod output;
mod pipeline;
mod provisioner;
mod sequencer;
mod stack_lua;
mod template;

pub use error::{
    DependencyViolation, EngineError, GraphError, PipelineError, StackEvalError, TemplateError,
    Unresolved,
};
pub use graph::{build_submission_order, dependency_edges, verify_trace};
pub use output::Output;
pub use pipeline::{DeployOptions, build_plan, build_plan_for_stack, deploy_stack, load_stack};
pub use provisioner::{
    DatabaseEndpoint, KubectlEngine, ProvisioningEngine, Realized, RecordingEngine, Submission,
    TraceEvent, TracePhase,
};
pub use sequencer::{Outputs, deploy};
pub use stack_lua::evaluate_stack;
pub use template::{MaterializedManifest, absent_tokens, materialize, materialize_in, substitute};
