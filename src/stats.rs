//! Formatting helpers for durations, byte counts, percentile summaries, and
//! server error outcomes shared across the upload and download summaries.

use std::time::Duration;

use crate::fhir::{ErrorResponse, OperationOutcome};

/// Statistics about measured durations: the mean and max as well as the
/// 50th, 95th and 99th percentiles.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DurationStatistics {
    pub mean: Duration,
    pub q50: Duration,
    pub q95: Duration,
    pub q99: Duration,
    pub max: Duration,
}

/// Calculates the DurationStatistics for a set of durations given in seconds.
/// Quantile indices are nearest-rank (floor). An empty set yields all zeros.
pub fn calculate_duration_statistics(durations: &[f64]) -> DurationStatistics {
    if durations.is_empty() {
        return DurationStatistics::default();
    }

    let mut sorted = durations.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();
    let to_duration = |secs: f64| Duration::from_millis((secs * 1000.0) as u64);

    DurationStatistics {
        mean: to_duration(sorted.iter().sum::<f64>() / n as f64),
        q50: to_duration(sorted[n / 2]),
        q95: to_duration(sorted[(n as f32 * 0.95) as usize]),
        q99: to_duration(sorted[(n as f32 * 0.99) as usize]),
        max: to_duration(sorted[n - 1]),
    }
}

impl DurationStatistics {
    /// Renders the `mean, 50, 95, 99, max` cell of a summary row.
    pub fn summary_row(&self) -> String {
        format!(
            "{}, {}, {}, {}, {}",
            fmt_duration_human(self.mean),
            fmt_duration_human(self.q50),
            fmt_duration_human(self.q95),
            fmt_duration_human(self.q99),
            fmt_duration_human(self.max)
        )
    }
}

/// Format a byte count as a human-readable string up to a unit of PiB
/// (e.g. "1.23 MiB").
pub fn fmt_bytes_human(bytes: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    let mut size = bytes;
    let mut unit_idx = 0usize;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Format a duration in a human-readable form: millisecond precision under
/// one minute, second precision at or above (e.g. "512ms", "1.012s", "1m2s").
pub fn fmt_duration_human(d: Duration) -> String {
    if d < Duration::from_secs(60) {
        let millis = (d.as_secs_f64() * 1000.0).round() as u64;
        if millis < 1000 {
            return format!("{}ms", millis);
        }
        let formatted = format!("{:.3}", millis as f64 / 1000.0);
        let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
        return format!("{}s", trimmed);
    }

    let secs = d.as_secs_f64().round() as u64;
    let hours = secs / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else {
        format!("{}m{}s", minutes, seconds)
    }
}

/// Indent every line of source with the given number of spaces.
pub fn indent(steps: usize, source: &str) -> String {
    let indentation = " ".repeat(steps);
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        if line.is_empty() {
            out.push('\n');
        } else {
            out.push_str(&indentation);
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Format the issues of one or more operation outcomes, `---`-separated.
pub fn fmt_operation_outcomes(outcomes: &[&OperationOutcome]) -> String {
    let mut out = String::new();

    for (i, outcome) in outcomes.iter().enumerate() {
        if i != 0 {
            out.push_str("---\n");
        }
        for (j, issue) in outcome.issue.iter().enumerate() {
            if j != 0 {
                out.push_str("---\n");
            }
            out.push_str(&format!("Severity    : {}\n", issue.severity));
            out.push_str(&format!("Code        : {}\n", issue.code));
            if let Some(details) = &issue.details {
                if let Some(text) = &details.text {
                    out.push_str(&format!("Details     : {}\n", text));
                } else if let Some(code) = details.coding.first().and_then(|c| c.code.as_ref()) {
                    out.push_str(&format!("Details     : {}\n", code));
                }
            }
            if let Some(diagnostics) = &issue.diagnostics {
                out.push_str(&format!("Diagnostics : {}\n", diagnostics));
            }
            if !issue.expression.is_empty() {
                out.push_str(&format!("Expression  : {}\n", issue.expression.join(", ")));
            }
        }
    }

    out
}

/// Format an ErrorResponse as a status-code line followed by its outcome
/// issues, or the verbatim body when no outcome could be decoded.
pub fn fmt_error_response(err: &ErrorResponse) -> String {
    let mut out = format!("StatusCode  : {}\n", err.status);
    if let Some(outcome) = &err.outcome {
        out.push_str(&fmt_operation_outcomes(&[outcome]));
    } else if let Some(body) = &err.other {
        out.push_str(&format!("Body        : {}\n", body.trim_end()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir::{CodeableConcept, OperationOutcomeIssue, coding};

    #[test]
    fn test_duration_statistics_empty() {
        let stats = calculate_duration_statistics(&[]);
        assert_eq!(Duration::ZERO, stats.mean);
        assert_eq!(Duration::ZERO, stats.q50);
        assert_eq!(Duration::ZERO, stats.q95);
        assert_eq!(Duration::ZERO, stats.q99);
        assert_eq!(Duration::ZERO, stats.max);
    }

    #[test]
    fn test_duration_statistics_single_sample() {
        let stats = calculate_duration_statistics(&[1.0]);
        assert_eq!(Duration::from_secs(1), stats.mean);
        assert_eq!(Duration::from_secs(1), stats.q50);
        assert_eq!(Duration::from_secs(1), stats.q95);
        assert_eq!(Duration::from_secs(1), stats.q99);
        assert_eq!(Duration::from_secs(1), stats.max);
    }

    #[test]
    fn test_duration_statistics_ordering() {
        // Input deliberately unsorted; percentiles must come from a sort.
        let samples: Vec<f64> = (1..=100).rev().map(|n| n as f64 / 100.0).collect();
        let stats = calculate_duration_statistics(&samples);
        assert!(stats.q50 <= stats.q95);
        assert!(stats.q95 <= stats.q99);
        assert!(stats.q99 <= stats.max);
        assert_eq!(Duration::from_millis(1000), stats.max);
        assert_eq!(Duration::from_millis(510), stats.q50);
        assert_eq!(Duration::from_millis(960), stats.q95);
    }

    #[test]
    fn test_fmt_bytes_human() {
        assert_eq!("0.00 B", fmt_bytes_human(0.0));
        assert_eq!("512.00 B", fmt_bytes_human(512.0));
        assert_eq!("1.00 KiB", fmt_bytes_human(1024.0));
        assert_eq!("1.50 KiB", fmt_bytes_human(1536.0));
        assert_eq!("1.00 MiB", fmt_bytes_human(1024.0 * 1024.0));
        assert_eq!("1.00 GiB", fmt_bytes_human(f64::powi(1024.0, 3)));
        assert_eq!("1.00 TiB", fmt_bytes_human(f64::powi(1024.0, 4)));
        assert_eq!("1.00 PiB", fmt_bytes_human(f64::powi(1024.0, 5)));
        // Largest unit is forced beyond PiB.
        assert_eq!("1024.00 PiB", fmt_bytes_human(f64::powi(1024.0, 6)));
    }

    #[test]
    fn test_fmt_bytes_human_suffixes() {
        for (bytes, unit) in [
            (1.0, "B"),
            (10.0 * f64::powi(1024.0, 1), "KiB"),
            (10.0 * f64::powi(1024.0, 2), "MiB"),
            (10.0 * f64::powi(1024.0, 3), "GiB"),
            (10.0 * f64::powi(1024.0, 4), "TiB"),
            (10.0 * f64::powi(1024.0, 5), "PiB"),
        ] {
            assert!(fmt_bytes_human(bytes).ends_with(unit), "{} should end with {}", bytes, unit);
        }
    }

    #[test]
    fn test_fmt_duration_human() {
        assert_eq!("512ms", fmt_duration_human(Duration::from_millis(512)));
        assert_eq!("1s", fmt_duration_human(Duration::from_millis(1000)));
        assert_eq!("1.012s", fmt_duration_human(Duration::from_millis(1012)));
        assert_eq!("2.8s", fmt_duration_human(Duration::from_millis(2800)));
        assert_eq!("1m0s", fmt_duration_human(Duration::from_millis(60000)));
        assert_eq!("1m2s", fmt_duration_human(Duration::from_millis(62000)));
        assert_eq!("10m20s", fmt_duration_human(Duration::from_millis(620000)));
        assert_eq!("1h0m0s", fmt_duration_human(Duration::from_millis(3600000)));
    }

    #[test]
    fn test_fmt_operation_outcomes() {
        let outcome = OperationOutcome {
            issue: vec![OperationOutcomeIssue {
                severity: "error".to_string(),
                code: "exception".to_string(),
                details: Some(CodeableConcept {
                    coding: vec![],
                    text: Some("something failed".to_string()),
                }),
                diagnostics: Some("stack".to_string()),
                expression: vec!["Patient.name".to_string()],
            }],
        };
        let formatted = fmt_operation_outcomes(&[&outcome]);
        assert_eq!(
            "Severity    : error\n\
             Code        : exception\n\
             Details     : something failed\n\
             Diagnostics : stack\n\
             Expression  : Patient.name\n",
            formatted
        );
    }

    #[test]
    fn test_fmt_operation_outcomes_details_coding_fallback() {
        let outcome = OperationOutcome {
            issue: vec![OperationOutcomeIssue {
                severity: "error".to_string(),
                code: "invalid".to_string(),
                details: Some(CodeableConcept {
                    coding: vec![coding("http://example.com/codes", "MSG_NO_MATCH")],
                    text: None,
                }),
                diagnostics: None,
                expression: vec![],
            }],
        };
        let formatted = fmt_operation_outcomes(&[&outcome]);
        assert!(formatted.contains("Details     : MSG_NO_MATCH\n"));
    }

    #[test]
    fn test_indent() {
        assert_eq!("  a\n  b\n", indent(2, "a\nb\n"));
        assert_eq!("\n", indent(2, "\n"));
    }
}
