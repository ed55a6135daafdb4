//! Terminal output for challenges and refreshes, by verbosity level.
//!
//! - Minimal: one line per model
//! - Compact: arrow header plus the reply
//! - Verbose: separated blocks with full token usage

use crate::challenge::ChallengeReport;
use crate::config::LogVerbosity;
use crate::discovery::{RefreshOutcome, ServiceFailure};
use crate::error::LlmError;
use crate::message::LlmResponse;
use std::io::Write;

const SEPARATOR: &str = "────────────────────────────────────────";
const PREVIEW_CHARS: usize = 60;

/// Format duration in human-readable form.
fn format_duration(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}

fn token_summary(response: &LlmResponse) -> String {
    match response.total_tokens.or(response.message.token_count) {
        Some(total) => format!("{} tokens", total),
        None => "- tokens".to_string(),
    }
}

/// First line of `text`, cut to a short preview.
fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{}…", cut)
    } else {
        line.to_string()
    }
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Format one model's outcome.
pub fn format_outcome(
    model_id: &str,
    outcome: Result<&LlmResponse, &LlmError>,
    verbosity: &LogVerbosity,
) -> String {
    match verbosity {
        LogVerbosity::Minimal => format_minimal(model_id, outcome),
        LogVerbosity::Compact => format_compact(model_id, outcome),
        LogVerbosity::Verbose => format_verbose(model_id, outcome),
    }
}

fn format_minimal(model_id: &str, outcome: Result<&LlmResponse, &LlmError>) -> String {
    match outcome {
        Ok(response) => format!(
            "{} OK {} {}",
            model_id,
            token_summary(response),
            preview(&response.full_content())
        ),
        Err(error) => format!("{} ERROR {}", model_id, error.error_type()),
    }
}

fn format_compact(model_id: &str, outcome: Result<&LlmResponse, &LlmError>) -> String {
    let request_line = format!("→ {}", model_id);
    match outcome {
        Ok(response) => {
            let reason = response
                .finish_reason
                .as_ref()
                .map(|r| format!(", {}", r))
                .unwrap_or_default();
            format!(
                "{}\n← OK ({}{})\n{}",
                request_line,
                token_summary(response),
                reason,
                response.full_content()
            )
        }
        Err(error) => format!("{}\n← ERROR {}", request_line, error),
    }
}

fn format_verbose(model_id: &str, outcome: Result<&LlmResponse, &LlmError>) -> String {
    match outcome {
        Ok(response) => {
            let refusal = response
                .refusal
                .as_ref()
                .map(|r| format!("Refusal: {}\n", r))
                .unwrap_or_default();
            format!(
                "{separator}\n\
                 Model: {model}\n\
                 Status: OK\n\
                 Finish: {finish}\n\
                 Tokens: {prompt} prompt, {completion} completion, {total} total\n\
                 Cache: {cache_read} read, {cache_created} created\n\
                 {refusal}\
                 {separator}\n\
                 {content}",
                separator = SEPARATOR,
                model = model_id,
                finish = or_dash(response.finish_reason.as_deref()),
                prompt = or_dash(response.prompt_tokens),
                completion = or_dash(response.completion_tokens),
                total = or_dash(response.total_tokens.or(response.message.token_count)),
                cache_read = or_dash(response.cache_read_input_tokens),
                cache_created = or_dash(response.cache_creation_input_tokens),
                refusal = refusal,
                content = response.full_content(),
            )
        }
        Err(error) => format!(
            "{separator}\n\
             Model: {model}\n\
             Status: ERROR ({kind})\n\
             {error}\n\
             {separator}",
            separator = SEPARATOR,
            model = model_id,
            kind = error.error_type(),
            error = error,
        ),
    }
}

/// Format every outcome on the board, in model id order.
pub fn format_report(report: &ChallengeReport, verbosity: &LogVerbosity) -> String {
    let mut ids: Vec<&String> = report
        .responses
        .keys()
        .chain(report.errors.keys())
        .chain(report.pending.iter())
        .collect();
    ids.sort();
    ids.dedup();

    let blocks: Vec<String> = ids
        .into_iter()
        .map(|id| {
            if let Some(response) = report.responses.get(id) {
                format_outcome(id, Ok(response), verbosity)
            } else if let Some(error) = report.errors.get(id) {
                format_outcome(id, Err(error), verbosity)
            } else {
                match verbosity {
                    LogVerbosity::Minimal => format!("{} pending", id),
                    _ => format!("→ {}\n← pending...", id),
                }
            }
        })
        .collect();

    let joiner = match verbosity {
        LogVerbosity::Minimal => "\n",
        _ => "\n\n",
    };
    blocks.join(joiner)
}

/// Format the result of a catalog refresh.
pub fn format_refresh(
    outcome: &RefreshOutcome,
    failures: &[ServiceFailure],
    verbosity: &LogVerbosity,
) -> String {
    let (models, failed) = match outcome {
        RefreshOutcome::Skipped => return "Refresh already in progress, skipped".to_string(),
        RefreshOutcome::Completed { models, failures } => (*models, *failures),
    };

    match verbosity {
        LogVerbosity::Minimal => format!("{} models, {} services failed", models, failed),
        LogVerbosity::Compact | LogVerbosity::Verbose => {
            let mut lines = vec![format!("← {} models ({} services failed)", models, failed)];
            for failure in failures {
                let line = if *verbosity == LogVerbosity::Verbose {
                    format!(
                        "  {} [{}]: {} ({})",
                        failure.service_name,
                        failure.service_id,
                        failure.error,
                        failure.error.error_type()
                    )
                } else {
                    format!("  {}: {}", failure.service_name, failure.error)
                };
                lines.push(line);
            }
            lines.join("\n")
        }
    }
}

/// Format the closing line of a streamed reply.
pub fn format_stream_end(
    outcome: Result<&LlmResponse, &LlmError>,
    elapsed_ms: u64,
    verbosity: &LogVerbosity,
) -> String {
    let duration = format_duration(elapsed_ms);
    match (outcome, verbosity) {
        (Ok(response), LogVerbosity::Minimal) => {
            format!("OK {} [{}]", duration, token_summary(response))
        }
        (Ok(response), LogVerbosity::Compact) => {
            format!("← OK ({}, {})", duration, token_summary(response))
        }
        (Ok(response), LogVerbosity::Verbose) => format!(
            "{}\nStatus: OK\nTiming: {} total\nTokens: {} (estimated)\nFinish: {}",
            SEPARATOR,
            duration,
            or_dash(response.message.token_count),
            or_dash(response.finish_reason.as_deref())
        ),
        (Err(error), LogVerbosity::Minimal) => format!("ERROR {} {}", duration, error.error_type()),
        (Err(error), _) => format!("← ERROR {} ({})", error, duration),
    }
}

/// Write a challenge report to the given writer.
pub fn log_report<W: Write>(
    writer: &mut W,
    report: &ChallengeReport,
    verbosity: &LogVerbosity,
) -> std::io::Result<()> {
    writeln!(writer, "{}", format_report(report, verbosity))
}
