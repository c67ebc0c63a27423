use std::fmt::Write;
use std::io::{self, IsTerminal};

use caisson_domain::{
    DeployReport, EdgeKind, PlanReport, PlannedResource, ResourceResult, ResourceStatus,
};
use console::Style;

mod error;
mod options;
mod redaction;

pub use error::ReportError;
pub use options::{ColorChoice, OutputFormat, RenderOptions};
pub use redaction::redact_sensitive;

/// Render a plan report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_plan(
    report: &PlanReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|source| ReportError::JsonSerialize { source }),
        OutputFormat::Text => Ok(render_plan_text(report, options)),
    }
}

/// Render a deploy report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_deploy(
    report: &DeployReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|source| ReportError::JsonSerialize { source }),
        OutputFormat::Text => Ok(render_deploy_text(report, options)),
    }
}

// ---------------------------------------------------------------------------
// Plan text
// ---------------------------------------------------------------------------

fn render_plan_text(report: &PlanReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = Palette::new(options.color);

    append_header(&mut output, "preview", options.target.as_deref(), None, style);
    let context = &report.context;
    let _ = writeln!(
        output,
        "  {}",
        style.paint(
            Tone::Muted,
            &format!(
                "stack {} on {} ({}), namespace {}",
                context.stack, context.cluster, context.region, context.namespace
            )
        )
    );

    append_warnings_and_errors(&mut output, &report.warnings, &report.errors, style);

    if report.resources.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "  Nothing to submit.");
        return output;
    }

    let _ = writeln!(output);
    for resource in &report.resources {
        append_planned_line(&mut output, resource, options, style);
    }

    append_exports(&mut output, report.exports.iter().map(String::as_str), style);

    let _ = writeln!(output);
    let warning_count = report
        .resources
        .iter()
        .map(|resource| resource.warnings.len())
        .sum::<usize>()
        + report.warnings.len();
    let _ = writeln!(
        output,
        "{}",
        format_plan_tally(report.resources.len(), warning_count, report.errors.len(), style)
    );

    output
}

fn append_planned_line(
    output: &mut String,
    resource: &PlannedResource,
    options: &RenderOptions,
    style: Palette,
) {
    let _ = writeln!(
        output,
        "  {} {} {}{}",
        style.paint(Tone::Muted, &format!("{:>2}", resource.position)),
        pad_label(&style.paint(Tone::Good, &resource.kind)),
        pad_name(&style.paint(Tone::Body, resource.name.as_str())),
        style.paint(Tone::Muted, &resource.summary)
    );

    if !resource.depends_on.is_empty() {
        let waits: Vec<String> = resource
            .depends_on
            .iter()
            .map(|edge| match edge.kind {
                EdgeKind::Declared => edge.upstream.to_string(),
                EdgeKind::Reference => format!("{} (ref)", edge.upstream),
            })
            .collect();
        let _ = writeln!(
            output,
            "       {}",
            style.paint(Tone::Muted, &format!("waits on {}", waits.join(", ")))
        );
    }

    if options.verbose
        && let Some(hash) = &resource.content_hash
    {
        let short = &hash[..hash.len().min(12)];
        let _ = writeln!(
            output,
            "       {}",
            style.paint(Tone::Muted, &format!("template: sha256:{short}"))
        );
    }

    for warning in &resource.warnings {
        let prefix = style.paint(Tone::CautionMark, "warn:");
        let _ = writeln!(output, "       {prefix} {warning}");
    }
}

fn format_plan_tally(total: usize, warnings: usize, errors: usize, style: Palette) -> String {
    let mut parts = vec![style.paint(Tone::Good, &format!("{total} to submit"))];
    if warnings > 0 {
        let noun = if warnings == 1 { "warning" } else { "warnings" };
        parts.push(style.paint(Tone::Caution, &format!("{warnings} {noun}")));
    }
    if errors > 0 {
        let noun = if errors == 1 { "error" } else { "errors" };
        parts.push(style.paint(Tone::Bad, &format!("{errors} {noun}")));
    }
    format!("{} {}", style.paint(Tone::Heading, "Plan:"), parts.join(", "))
}

// ---------------------------------------------------------------------------
// Deploy text
// ---------------------------------------------------------------------------

fn render_deploy_text(report: &DeployReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = Palette::new(options.color);

    let suffix = report.dry_run.then(|| style.paint(Tone::Muted, "(dry run)"));
    append_header(
        &mut output,
        "up",
        options.target.as_deref(),
        suffix.as_deref(),
        style,
    );
    append_warnings_and_errors(&mut output, &[], &report.errors, style);

    if report.results.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "  Nothing to submit.");
        return output;
    }

    let _ = writeln!(output);
    for result in &report.results {
        append_result_line(&mut output, result, options, style);
    }

    let exports: Vec<String> = report
        .exports
        .iter()
        .map(|(name, value)| format!("{name} = {value}"))
        .collect();
    append_exports(&mut output, exports.iter().map(String::as_str), style);

    let _ = writeln!(output);
    let _ = writeln!(output, "{}", DeployTally::from_results(&report.results).format(style));

    output
}

fn append_result_line(
    output: &mut String,
    result: &ResourceResult,
    options: &RenderOptions,
    style: Palette,
) {
    let (symbol, label, tone, mark) = match result.status {
        ResourceStatus::Realized => ("+", "realized", Tone::Good, Tone::GoodMark),
        ResourceStatus::Failed => ("!", "failed", Tone::Bad, Tone::BadMark),
        ResourceStatus::Skipped => ("-", "skipped", Tone::Caution, Tone::CautionMark),
    };
    let symbol = style.paint(mark, symbol);
    let label = style.paint(tone, label);
    let detail = match (&result.status, &result.blocked_by) {
        (ResourceStatus::Skipped, Some(upstream)) => {
            style.paint(Tone::Muted, &format!("blocked by {upstream}"))
        }
        _ => style.paint(Tone::Muted, &result.kind),
    };
    let _ = writeln!(
        output,
        "  {symbol} {}{}{detail}",
        pad_label(&label),
        pad_name(&style.paint(Tone::Body, result.name.as_str()))
    );

    if result.status == ResourceStatus::Failed
        && let Some(error) = &result.error
    {
        let _ = writeln!(output, "       {}", style.paint(Tone::Bad, error));
    }

    if options.verbose {
        for (field, value) in &result.outputs {
            let line = format!("{field}: {value}");
            let _ = writeln!(output, "       {}", style.paint(Tone::Muted, &line));
        }
    }
}

struct DeployTally {
    realized: usize,
    failed: usize,
    skipped: usize,
}

impl DeployTally {
    fn from_results(results: &[ResourceResult]) -> Self {
        let mut tally = Self {
            realized: 0,
            failed: 0,
            skipped: 0,
        };
        for result in results {
            match result.status {
                ResourceStatus::Realized => tally.realized += 1,
                ResourceStatus::Failed => tally.failed += 1,
                ResourceStatus::Skipped => tally.skipped += 1,
            }
        }
        tally
    }

    fn format(&self, style: Palette) -> String {
        let mut parts = Vec::new();
        if self.realized > 0 {
            parts.push(style.paint(Tone::Good, &format!("{} realized", self.realized)));
        }
        if self.failed > 0 {
            parts.push(style.paint(Tone::Bad, &format!("{} failed", self.failed)));
        }
        if self.skipped > 0 {
            parts.push(style.paint(Tone::Caution, &format!("{} skipped", self.skipped)));
        }
        if parts.is_empty() {
            format!("{} nothing to do", style.paint(Tone::Heading, "Deployed:"))
        } else {
            format!("{} {}", style.paint(Tone::Heading, "Deployed:"), parts.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// Shared sections
// ---------------------------------------------------------------------------

fn append_header(
    output: &mut String,
    command: &str,
    target: Option<&str>,
    suffix: Option<&str>,
    style: Palette,
) {
    let _ = write!(output, "{}", style.paint(Tone::Heading, command));
    if let Some(t) = target {
        let _ = write!(output, " {}", style.paint(Tone::Muted, t));
    }
    if let Some(s) = suffix {
        let _ = write!(output, " {s}");
    }
    let _ = writeln!(output);
}

fn append_exports<'a>(
    output: &mut String,
    exports: impl Iterator<Item = &'a str>,
    style: Palette,
) {
    let mut exports = exports.peekable();
    if exports.peek().is_none() {
        return;
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "  {}", style.paint(Tone::Heading, "exports"));
    for export in exports {
        let _ = writeln!(output, "    {export}");
    }
}

fn append_warnings_and_errors(
    output: &mut String,
    warnings: &[String],
    errors: &[String],
    style: Palette,
) {
    if warnings.is_empty() && errors.is_empty() {
        return;
    }
    let _ = writeln!(output);
    for w in warnings {
        let _ = writeln!(output, "  {} {w}", style.paint(Tone::CautionMark, "warn:"));
    }
    for e in errors {
        let _ = writeln!(output, "  {} {e}", style.paint(Tone::BadMark, "error:"));
    }
}

// ---------------------------------------------------------------------------
// Palette
// ---------------------------------------------------------------------------

const LABEL_WIDTH: usize = 12;
const NAME_WIDTH: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Good,
    GoodMark,
    Bad,
    BadMark,
    Caution,
    CautionMark,
    Heading,
    Body,
    Muted,
}

impl Tone {
    fn style(self) -> Style {
        match self {
            Self::Good => Style::new().green(),
            Self::GoodMark => Style::new().green().bold(),
            Self::Bad => Style::new().red(),
            Self::BadMark => Style::new().red().bold(),
            Self::Caution => Style::new().yellow(),
            Self::CautionMark => Style::new().yellow().bold(),
            Self::Heading => Style::new().white().bold(),
            Self::Body => Style::new().white(),
            Self::Muted => Style::new().dim(),
        }
    }
}

/// Applies tones only when color output is enabled.
#[derive(Debug, Clone, Copy)]
struct Palette {
    enabled: bool,
}

impl Palette {
    fn new(choice: ColorChoice) -> Self {
        let enabled = match choice {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => io::stdout().is_terminal(),
        };
        Self { enabled }
    }

    fn paint(self, tone: Tone, text: &str) -> String {
        if self.enabled {
            tone.style().apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }
}

// Width is measured without ANSI escapes; overlong cells keep one separating space.
fn pad_to(painted: &str, width: usize) -> String {
    let visible = console::measure_text_width(painted);
    let fill = width.saturating_sub(visible).max(1);
    format!("{painted}{}", " ".repeat(fill))
}

fn pad_label(painted: &str) -> String {
    pad_to(painted, LABEL_WIDTH)
}

fn pad_name(painted: &str) -> String {
    pad_to(painted, NAME_WIDTH)
}
