use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::fmt;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
};

const FORMAT_TRACE_TARGET: &str = "markclip::format_trace";
const MAX_DIFF_CHARS: usize = 2048;
const PREVIEW_CHAR_LIMIT: usize = 160;
const TARGET_GUTTER_WIDTH: usize = 24;
const TIMESTAMP_FORMAT: &[FormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// One formatter run: the converted body going in, the clipboard text coming
/// out, and what each rule did in between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatTrace {
    pub input: String,
    pub output: String,
    pub steps: Vec<FormatStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatStep {
    pub name: String,
    pub before: String,
    pub after: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Applied { matches: usize },
    Unchanged,
    Skipped { reason: String },
}

impl FormatTrace {
    pub fn new(input: String, output: String, steps: Vec<FormatStep>) -> Self {
        Self {
            input,
            output,
            steps,
        }
    }

    pub fn applied_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step.outcome, StepOutcome::Applied { .. }))
            .count()
    }

    pub fn skipped_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step.outcome, StepOutcome::Skipped { .. }))
            .count()
    }

    pub fn render_pretty(&self, use_color: bool) -> String {
        let mut lines = vec![format!(
            "┌─ Format (steps: {}, applied: {}, skipped: {})",
            self.steps.len(),
            self.applied_steps(),
            self.skipped_steps()
        )];
        push_body_line(
            &mut lines,
            format!("IN  : {}", preview_value(&self.input, use_color)),
        );

        for step in &self.steps {
            for line in step.render_lines(use_color) {
                push_body_line(&mut lines, line);
            }
        }

        push_body_line(
            &mut lines,
            format!("OUT : {}", preview_value(&self.output, use_color)),
        );
        lines.push("└─".to_string());

        lines.join("\n")
    }
}

impl FormatStep {
    pub fn replaced(name: impl Into<String>, before: String, after: String, matches: usize) -> Self {
        let outcome = if before == after {
            StepOutcome::Unchanged
        } else {
            StepOutcome::Applied { matches }
        };
        Self {
            name: name.into(),
            before,
            after,
            outcome,
        }
    }

    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: String::new(),
            after: String::new(),
            outcome: StepOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    fn render_lines(&self, use_color: bool) -> Vec<String> {
        match &self.outcome {
            StepOutcome::Unchanged => Vec::new(),
            StepOutcome::Skipped { reason } => {
                let line = format!("• {} skipped: {}", self.name, reason);
                if use_color {
                    vec![line.yellow().to_string()]
                } else {
                    vec![line]
                }
            }
            StepOutcome::Applied { matches } => {
                let mut lines = vec![format!("• {} (×{})", self.name, matches)];
                match self.inline_diff(use_color) {
                    Some(diff_lines) => {
                        lines.extend(diff_lines.into_iter().map(|diff| format!("  {}", diff)))
                    }
                    None => {
                        lines.push(format!("  - {}", preview_value(&self.before, use_color)));
                        lines.push(format!("  + {}", preview_value(&self.after, use_color)));
                    }
                }
                lines
            }
        }
    }

    fn inline_diff(&self, use_color: bool) -> Option<Vec<String>> {
        if self.before.len() + self.after.len() > MAX_DIFF_CHARS {
            return None;
        }

        let diff = TextDiff::from_words(&self.before, &self.after);
        let mut removed = String::new();
        let mut added = String::new();
        let mut has_delete = false;
        let mut has_insert = false;

        for change in diff.iter_all_changes() {
            let escaped = escape_fragment(change.value());
            match change.tag() {
                ChangeTag::Delete => {
                    has_delete = true;
                    removed.push_str(&stylize(escaped, use_color, DiffStyle::Delete));
                }
                ChangeTag::Insert => {
                    has_insert = true;
                    added.push_str(&stylize(escaped, use_color, DiffStyle::Insert));
                }
                ChangeTag::Equal => {
                    removed.push_str(&stylize(escaped.clone(), use_color, DiffStyle::Context));
                    added.push_str(&stylize(escaped, use_color, DiffStyle::Context));
                }
            }
        }

        if !has_delete && !has_insert {
            return None;
        }

        let mut lines = Vec::new();
        if has_delete {
            lines.push(format!("- {}", removed));
        }
        if has_insert {
            lines.push(format!("+ {}", added));
        }
        Some(lines)
    }
}

#[derive(Debug, Clone, Copy)]
enum DiffStyle {
    Delete,
    Insert,
    Context,
}

fn stylize(fragment: String, use_color: bool, style: DiffStyle) -> String {
    if !use_color {
        return fragment;
    }

    match style {
        DiffStyle::Delete => fragment.red().to_string(),
        DiffStyle::Insert => fragment.green().to_string(),
        DiffStyle::Context => fragment.dimmed().to_string(),
    }
}

fn escape_fragment(value: &str) -> String {
    let mut rendered = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\n' => rendered.push('⏎'),
            '\t' => rendered.push('⇥'),
            '\r' => rendered.push('␍'),
            c if c.is_control() => rendered.push_str(&format!("\\u{{{:04X}}}", c as u32)),
            c => rendered.push(c),
        }
    }
    rendered
}

fn push_body_line(lines: &mut Vec<String>, content: String) {
    lines.push(format!("│ {}", content));
}

fn preview_value(value: &str, use_color: bool) -> String {
    let mut preview: String = value.chars().take(PREVIEW_CHAR_LIMIT).collect();
    if value.chars().count() > PREVIEW_CHAR_LIMIT {
        preview.push_str("...");
    }
    let escaped = escape_fragment(&preview);
    if use_color {
        escaped.cyan().to_string()
    } else {
        escaped
    }
}

#[derive(Debug, Default)]
struct TraceVisitor {
    trace_json: Option<String>,
}

impl tracing::field::Visit for TraceVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "trace_json" {
            self.trace_json = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "trace_json" && self.trace_json.is_none() {
            self.trace_json = Some(format!("{value:?}"));
        }
    }
}

/// Event formatter for the host process: timestamp, colored level, padded
/// target, and a rendered box for format traces.
#[derive(Default)]
pub struct MarkclipLogFormatter;

impl MarkclipLogFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl<S, N> FormatEvent<S, N> for MarkclipLogFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let use_color = writer.has_ansi_escapes();

        write_prefix(&mut writer, metadata, use_color)?;
        ctx.format_fields(writer.by_ref(), event)?;
        writer.write_char('\n')?;

        if metadata.target() != FORMAT_TRACE_TARGET {
            return Ok(());
        }

        let mut visitor = TraceVisitor::default();
        event.record(&mut visitor);
        if let Some(json) = visitor.trace_json {
            match serde_json::from_str::<FormatTrace>(&json) {
                Ok(trace) => {
                    writer.write_str(&trace.render_pretty(use_color))?;
                    writer.write_char('\n')?;
                }
                Err(err) => {
                    writer.write_str("│ Failed to render format trace: ")?;
                    writer.write_str(&err.to_string())?;
                    writer.write_char('\n')?;
                }
            }
        }

        Ok(())
    }
}

/// True when format traces would be emitted; lets callers skip collecting them.
pub fn format_trace_enabled() -> bool {
    tracing::enabled!(target: FORMAT_TRACE_TARGET, Level::DEBUG)
}

pub fn record_format_trace(trace: FormatTrace) {
    if !format_trace_enabled() {
        return;
    }
    match serde_json::to_string(&trace) {
        Ok(json) => tracing::event!(
            target: FORMAT_TRACE_TARGET,
            Level::DEBUG,
            trace_json = json.as_str(),
            steps = trace.steps.len(),
            applied_steps = trace.applied_steps(),
            "format pipeline"
        ),
        Err(_) => tracing::event!(
            target: FORMAT_TRACE_TARGET,
            Level::DEBUG,
            "format pipeline (serialization failure)"
        ),
    }
}

fn write_prefix(
    writer: &mut Writer<'_>,
    metadata: &tracing::Metadata<'_>,
    use_color: bool,
) -> fmt::Result {
    let timestamp = format_timestamp();
    if use_color {
        writer.write_str(&timestamp.as_str().dimmed().to_string())?;
    } else {
        writer.write_str(&timestamp)?;
    }

    let level = format!("{:>5}", metadata.level());
    writer.write_char(' ')?;
    if use_color {
        writer.write_str(&color_level(&level, *metadata.level()))?;
    } else {
        writer.write_str(&level)?;
    }
    writer.write_char(' ')?;

    let target = format!("{:<width$}", metadata.target(), width = TARGET_GUTTER_WIDTH);
    if use_color {
        writer.write_str(&target.blue().dimmed().to_string())?;
    } else {
        writer.write_str(&target)?;
    }
    writer.write_str(": ")
}

fn color_level(text: &str, level: Level) -> String {
    match level {
        Level::ERROR => text.red().bold().to_string(),
        Level::WARN => text.yellow().bold().to_string(),
        Level::INFO => text.green().to_string(),
        Level::DEBUG => text.cyan().to_string(),
        Level::TRACE => text.dimmed().to_string(),
    }
}

fn format_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| "0000-00-00 00:00:00".to_string())
}
