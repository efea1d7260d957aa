//! Result rendering: human-readable, JSON and JUnit XML.

use crate::runner::{RunResult, Status, SuiteResult, TestResult};
use crate::suite::Suite;
use clap::ValueEnum;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

/// Render a run in the requested format.
pub fn render(result: &RunResult, format: OutputFormat, verbose: bool) -> String {
    match format {
        OutputFormat::Human => format_human(result, verbose),
        OutputFormat::Json => format_json(result),
        OutputFormat::Junit => format_junit_xml(result),
    }
}

fn format_human(result: &RunResult, verbose: bool) -> String {
    let mut out = String::new();
    write_suite_human(&mut out, &result.root, 0, verbose);
    let _ = writeln!(
        out,
        "\n{} passed, {} failed, {} skipped ({:.2?})",
        result.passed(),
        result.failed(),
        result.skipped(),
        result.duration
    );
    out
}

fn write_suite_human(out: &mut String, suite: &SuiteResult, depth: usize, verbose: bool) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{indent}{}", suite.title);

    for test in &suite.tests {
        let marker = match test.status {
            Status::Passed => "✓",
            Status::Failed => "✗",
            Status::Skipped => "-",
        };
        let _ = writeln!(out, "{indent}  {marker} {} ({:.2?})", test.name, test.duration);

        if let Some(failure) = &test.failure {
            let _ = writeln!(out, "{indent}    {}", failure.message);
            if !failure.output.is_empty() {
                for line in failure.output.lines() {
                    let _ = writeln!(out, "{indent}      {line}");
                }
            }
        }
        if verbose {
            for case in &test.cases {
                let first_line = case.command.lines().next().unwrap_or_default();
                let _ = writeln!(out, "{indent}    [{:?}] {first_line}", case.status);
            }
        }
    }

    for child in &suite.children {
        write_suite_human(out, child, depth + 1, verbose);
    }
}

fn format_json(result: &RunResult) -> String {
    let output = serde_json::json!({
        "passed": result.passed(),
        "failed": result.failed(),
        "skipped": result.skipped(),
        "duration": result.duration.as_secs_f64(),
        "suites": result.root,
    });
    serde_json::to_string_pretty(&output).unwrap_or_default()
}

/// Format test results as JUnit XML, one `<testsuite>` per suite with tests.
fn format_junit_xml(result: &RunResult) -> String {
    let mut groups: Vec<(String, Vec<&TestResult>)> = Vec::new();
    result.root.walk(&mut Vec::new(), &mut |path, test| {
        let name = path.join("/");
        if groups.last().is_some_and(|(last, _)| *last == name)
            && let Some((_, tests)) = groups.last_mut()
        {
            tests.push(test);
        } else {
            groups.push((name, vec![test]));
        }
    });

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S");
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\">",
        result.passed() + result.failed() + result.skipped(),
        result.failed(),
        result.skipped(),
        result.duration.as_secs_f64()
    );

    for (name, tests) in &groups {
        let failures = tests.iter().filter(|t| t.status == Status::Failed).count();
        let skipped = tests.iter().filter(|t| t.status == Status::Skipped).count();
        let time: f64 = tests.iter().map(|t| t.duration.as_secs_f64()).sum();

        let _ = writeln!(
            xml,
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{failures}\" skipped=\"{skipped}\" time=\"{time:.3}\" timestamp=\"{timestamp}\">",
            escape_xml(name),
            tests.len(),
        );

        for test in tests {
            let _ = writeln!(
                xml,
                "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\">",
                escape_xml(&test.name),
                escape_xml(name),
                test.duration.as_secs_f64()
            );

            match (&test.status, &test.failure) {
                (Status::Failed, Some(failure)) => {
                    let _ = writeln!(
                        xml,
                        "      <failure message=\"{}\" type=\"{}\">",
                        escape_xml(&failure.message),
                        serde_json::to_value(failure.kind)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default()
                    );
                    let _ = writeln!(xml, "{}", escape_xml(&failure.output));
                    xml.push_str("      </failure>\n");
                }
                (Status::Skipped, _) => xml.push_str("      <skipped/>\n"),
                _ => {}
            }

            xml.push_str("    </testcase>\n");
        }

        xml.push_str("  </testsuite>\n");
    }

    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Render a built suite tree as an indented outline.
pub fn format_outline(suite: &Suite) -> String {
    let mut out = String::new();
    write_outline(&mut out, suite, 0);
    let _ = writeln!(
        out,
        "\n{} tests, {} cases",
        suite.test_count(),
        suite.case_count()
    );
    out
}

fn write_outline(out: &mut String, suite: &Suite, depth: usize) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{indent}{}", suite.title);
    for test in &suite.tests {
        let _ = writeln!(
            out,
            "{indent}  - {} (weight {}, {} cases)",
            test.title,
            test.weight,
            test.cases.len()
        );
    }
    for child in &suite.children {
        write_outline(out, child, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{Failure, FailureKind};
    use std::time::Duration;

    fn test_result(name: &str, status: Status, failure: Option<Failure>) -> TestResult {
        TestResult {
            name: name.to_string(),
            status,
            duration: Duration::from_millis(5),
            failure,
            cases: vec![],
        }
    }

    fn sample() -> RunResult {
        let failure = Failure {
            kind: FailureKind::ExitStatus,
            message: "command failed: command exited with status 2".to_string(),
            code: Some(2),
            output: "<bad> & worse".to_string(),
        };
        RunResult {
            root: SuiteResult {
                title: "Root".to_string(),
                tests: vec![test_result("ok", Status::Passed, None)],
                children: vec![SuiteResult {
                    title: "Chapter".to_string(),
                    tests: vec![
                        test_result("broken", Status::Failed, Some(failure)),
                        test_result("empty", Status::Skipped, None),
                    ],
                    children: vec![],
                }],
            },
            duration: Duration::from_millis(15),
        }
    }

    #[test]
    fn human_output_marks_each_test() {
        let out = render(&sample(), OutputFormat::Human, false);
        assert!(out.contains("✓ ok"));
        assert!(out.contains("✗ broken"));
        assert!(out.contains("- empty"));
        assert!(out.contains("exited with status 2"));
        assert!(out.contains("1 passed, 1 failed, 1 skipped"));
    }

    #[test]
    fn json_output_has_counts() {
        let out = render(&sample(), OutputFormat::Json, false);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["passed"], 1);
        assert_eq!(value["failed"], 1);
        assert_eq!(value["skipped"], 1);
        assert_eq!(value["suites"]["children"][0]["tests"][0]["status"], "failed");
        assert_eq!(
            value["suites"]["children"][0]["tests"][0]["failure"]["kind"],
            "exit_status"
        );
    }

    #[test]
    fn junit_groups_by_suite_path_and_escapes() {
        let out = render(&sample(), OutputFormat::Junit, false);
        assert!(out.contains("<testsuite name=\"Root\" tests=\"1\""));
        assert!(out.contains("<testsuite name=\"Root/Chapter\" tests=\"2\" failures=\"1\" skipped=\"1\""));
        assert!(out.contains("type=\"exit_status\""));
        assert!(out.contains("&lt;bad&gt; &amp; worse"));
        assert!(out.contains("<skipped/>"));
    }

    #[test]
    fn escape_xml_handles_quotes() {
        assert_eq!(escape_xml("a\"b'c"), "a&quot;b&apos;c");
    }
}
