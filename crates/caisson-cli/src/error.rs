use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    ArgumentParse(#[from] clap::Error),
    #[error(transparent)]
    Pipeline(#[from] caisson_engine::PipelineError),
    #[error(transparent)]
    Template(#[from] caisson_engine::TemplateError),
    #[error(transparent)]
    Report(#[from] caisson_report::ReportError),
    #[error("failed to start the async runtime")]
    Runtime {
        #[source]
        source: std::io::Error,
    },
}
