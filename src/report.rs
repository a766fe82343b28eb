//! Local run reporting.
//!
//! Console summary and JUnit XML output for a finished run. Both are local
//! conveniences; the remote submission happens in the orchestrator.

pub mod junit;

pub use junit::write_junit;

use crate::orchestrator::{RunOutcome, SubmissionOutcome};

/// Prints a summary of the run to the console.
///
/// Displays record counts with colored output and a closing status line.
pub fn print_summary(outcome: &RunOutcome) {
    println!();
    println!("Run {}:", outcome.discriminator);
    println!("  Executed: {}", outcome.executed);
    println!("  Passed:   {}", console::style(outcome.passed()).green());
    println!("  Failed:   {}", console::style(outcome.failed()).red());

    if outcome.skipped_no_source > 0 {
        println!(
            "  Skipped:  {} (no source code)",
            console::style(outcome.skipped_no_source).yellow()
        );
    }

    if outcome.rejected > 0 {
        println!("  Rejected: {}", console::style(outcome.rejected).yellow());
    }

    if outcome.unmatched > 0 {
        println!(
            "  Unmatched: {}",
            console::style(outcome.unmatched).red().bold()
        );
    }

    let submission = match &outcome.submission {
        SubmissionOutcome::Failed(_) => console::style(outcome.submission.to_string()).red(),
        SubmissionOutcome::Submitted { .. } => {
            console::style(outcome.submission.to_string()).green()
        }
        _ => console::style(outcome.submission.to_string()).dim(),
    };
    println!("  Submission: {}", submission);

    let elapsed = outcome.finished_at - outcome.started_at;
    println!(
        "  Duration: {:.1}s",
        elapsed.num_milliseconds().max(0) as f64 / 1000.0
    );

    println!();
    if outcome.executed == 0 {
        println!("{}", console::style("No executable tests.").yellow().bold());
    } else if outcome.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!(
            "{}",
            console::style(format!(
                "Engine exited with code {}.",
                outcome.engine_exit_code.unwrap_or_default()
            ))
            .red()
            .bold()
        );
    }
}
