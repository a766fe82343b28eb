//! JUnit XML report generation.
//!
//! Writes the correlated records of a run as a JUnit XML document, the
//! format CI systems read natively.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="2" failures="1" skipped="1" time="12.400">
//!   <testsuite name="run-20260101120000-1a2b3c4d" tests="2" failures="1" errors="0" skipped="1" time="12.400">
//!     <testcase classname="t-1" name="logs in" time="0.812"/>
//!     <testcase classname="t-2" name="adds item" time="1.020">
//!       <failure message="expected 1 item">expected 1 item</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Definitions without source code only contribute to the `skipped` count.

use std::path::Path;

use anyhow::Context;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::orchestrator::RunOutcome;
use crate::source::ResultRecord;

/// Renders the JUnit XML document for a run.
pub fn render_junit(outcome: &RunOutcome) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let tests = outcome.records.len().to_string();
    let failures = outcome.failed().to_string();
    let skipped = outcome.skipped_no_source.to_string();
    let elapsed = outcome.finished_at - outcome.started_at;
    let time = format!("{:.3}", elapsed.num_milliseconds().max(0) as f64 / 1000.0);

    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("tests", tests.as_str()));
    testsuites.push_attribute(("failures", failures.as_str()));
    testsuites.push_attribute(("skipped", skipped.as_str()));
    testsuites.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(testsuites))?;

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", outcome.discriminator.as_str()));
    testsuite.push_attribute(("tests", tests.as_str()));
    testsuite.push_attribute(("failures", failures.as_str()));
    testsuite.push_attribute(("errors", "0"));
    testsuite.push_attribute(("skipped", skipped.as_str()));
    testsuite.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(testsuite))?;

    for record in &outcome.records {
        write_testcase(&mut writer, record)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    record: &ResultRecord,
) -> anyhow::Result<()> {
    let name = if record.title.is_empty() {
        record.test_id.as_str()
    } else {
        record.title.as_str()
    };
    let time = format!("{:.3}", record.duration_ms as f64 / 1000.0);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", strip_invalid_xml_chars(&record.test_id).as_str()));
    testcase.push_attribute(("name", strip_invalid_xml_chars(name).as_str()));
    testcase.push_attribute(("time", time.as_str()));

    if record.passed {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    let message = strip_invalid_xml_chars(record.error_message.as_deref().unwrap_or("failed"));
    let first_line = message.lines().next().unwrap_or_default();
    let mut failure = BytesStart::new("failure");
    failure.push_attribute(("message", first_line));
    writer.write_event(Event::Start(failure))?;
    writer.write_event(Event::Text(BytesText::new(&message)))?;
    writer.write_event(Event::End(BytesEnd::new("failure")))?;

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Writes the JUnit report to `path`, creating parent directories.
pub fn write_junit(path: &Path, outcome: &RunOutcome) -> anyhow::Result<()> {
    let xml = render_junit(outcome)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    std::fs::write(path, xml).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("JUnit XML written to: {}", path.display());
    Ok(())
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn strip_invalid_xml_chars(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::orchestrator::{RunState, SubmissionOutcome};
    use crate::workspace::Discriminator;

    fn record(id: &str, title: &str, passed: bool, error: Option<&str>) -> ResultRecord {
        ResultRecord {
            test_id: id.to_string(),
            passed,
            duration_ms: 1500,
            error_message: error.map(str::to_string),
            title: title.to_string(),
        }
    }

    fn outcome(records: Vec<ResultRecord>) -> RunOutcome {
        let started_at = Utc::now();
        RunOutcome {
            discriminator: Discriminator::new("run-test").unwrap(),
            state: RunState::Failed,
            engine_exit_code: Some(1),
            executed: records.len(),
            skipped_no_source: 2,
            rejected: 0,
            unmatched: 0,
            records,
            submission: SubmissionOutcome::Disabled,
            started_at,
            finished_at: started_at + Duration::milliseconds(2500),
        }
    }

    #[test]
    fn test_render_counts_and_cases() {
        let xml = render_junit(&outcome(vec![
            record("t-1", "logs in", true, None),
            record("t-2", "adds item", false, Some("expected <1> item\n  at cart.spec.ts:4")),
        ]))
        .unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(r#"<testsuite name="run-test" tests="2" failures="1" errors="0" skipped="2" time="2.500">"#));
        assert!(xml.contains(r#"<testcase classname="t-1" name="logs in" time="1.500"/>"#));
        assert!(xml.contains(r#"<failure message="expected &lt;1&gt; item">"#));
        assert!(xml.contains("at cart.spec.ts:4"));
    }

    #[test]
    fn test_render_falls_back_to_test_id() {
        let xml = render_junit(&outcome(vec![record("t-9", "", false, None)])).unwrap();
        assert!(xml.contains(r#"name="t-9""#));
        assert!(xml.contains(r#"<failure message="failed">"#));
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reports/nested/junit.xml");
        write_junit(&path, &outcome(vec![record("t-1", "a", true, None)])).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("<testsuites"));
    }

    #[test]
    fn test_strip_invalid_xml_chars() {
        assert_eq!(strip_invalid_xml_chars("a\u{0}b\u{1b}[31mc"), "ab[31mc");
        assert_eq!(strip_invalid_xml_chars("tab\tnew\nline"), "tab\tnew\nline");
    }
}
