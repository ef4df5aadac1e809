//! Terminal summary of a suite run

use crate::runner::{SuiteReport, Verdict};
use comfy_table::{Cell, Color, Table};

/// Summary table with one row per check
pub fn summary_table(report: &SuiteReport) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["CHECK", "RESULT", "TIME", "DETAIL"]);

    for outcome in &report.outcomes {
        let (label, color, detail) = match &outcome.verdict {
            Verdict::Passed => ("PASS", Color::Green, String::new()),
            Verdict::Failed(reason) => ("FAIL", Color::Red, reason.clone()),
            Verdict::Skipped(reason) => ("SKIP", Color::Yellow, reason.clone()),
        };

        table.add_row(vec![
            Cell::new(&outcome.name),
            Cell::new(label).fg(color),
            Cell::new(format!("{:.1}s", outcome.elapsed.as_secs_f64())),
            Cell::new(detail),
        ]);
    }

    table
}

/// One line verdict for the whole suite
pub fn summary_line(report: &SuiteReport) -> String {
    let total = report.outcomes.len();
    let passed = total - report.failures();

    match &report.error {
        Some(error) => format!(
            "Suite '{}': {}/{} checks passed, run aborted: {}",
            report.suite, passed, total, error
        ),
        None => format!("Suite '{}': {}/{} checks passed", report.suite, passed, total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CheckOutcome;
    use std::time::Duration;

    fn report() -> SuiteReport {
        SuiteReport {
            suite: "nginx".to_string(),
            outcomes: vec![
                CheckOutcome {
                    name: "nginx is installed".to_string(),
                    verdict: Verdict::Passed,
                    elapsed: Duration::from_millis(1200),
                },
                CheckOutcome {
                    name: "nginx is running".to_string(),
                    verdict: Verdict::Failed("exit status 3".to_string()),
                    elapsed: Duration::from_secs(60),
                },
            ],
            error: None,
        }
    }

    #[test]
    fn test_summary_table() {
        let rendered = summary_table(&report()).to_string();
        assert!(rendered.contains("nginx is installed"));
        assert!(rendered.contains("PASS"));
        assert!(rendered.contains("FAIL"));
        assert!(rendered.contains("60.0s"));
    }

    #[test]
    fn test_summary_line() {
        let mut report = report();
        assert_eq!(summary_line(&report), "Suite 'nginx': 1/2 checks passed");

        report.error = Some("release failed".to_string());
        assert_eq!(
            summary_line(&report),
            "Suite 'nginx': 1/2 checks passed, run aborted: release failed"
        );
    }
}
