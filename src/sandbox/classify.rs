// Outcome classification and report assembly
#![allow(dead_code)]

use crate::sandbox::types::{CapturedRun, ExecutionReport, Verdict};
use std::time::Duration;

/// Appended to the error when user code failed and a test was supplied
pub const TEST_SKIPPED_NOTE: &str = "Test code not executed due to errors in user code.";

/// Settings that shape the report
#[derive(Debug, Clone, Copy)]
pub struct ReportPolicy<'a> {
    pub assertion_marker: &'a str,
    pub pass_banner: Option<&'a str>,
    pub timeout: Duration,
}

/// Classify a user run and the optional test run that followed it.
///
/// A failed user run is `Error` no matter what. A test run is
/// `TestFailed` when the assertion marker shows up anywhere in its
/// output, `Error` when it otherwise crashed or timed out.
pub fn classify(
    user_run: &CapturedRun,
    test_run: Option<&CapturedRun>,
    assertion_marker: &str,
) -> Verdict {
    if !user_run.is_clean() {
        return Verdict::Error;
    }

    match test_run {
        None => Verdict::Success,
        Some(run) if run.mentions(assertion_marker) => Verdict::TestFailed,
        Some(run) if !run.exited_cleanly() => Verdict::Error,
        Some(_) => Verdict::Success,
    }
}

/// Fixed message for a run killed by the timer
pub fn timeout_message(timeout: Duration) -> String {
    format!("Execution timed out after {} seconds.", timeout.as_secs_f64())
}

/// Merge both runs into the report returned to the caller
pub fn assemble(
    user_run: &CapturedRun,
    test_run: Option<&CapturedRun>,
    test_supplied: bool,
    lint_output: Option<String>,
    policy: &ReportPolicy<'_>,
) -> ExecutionReport {
    let verdict = classify(user_run, test_run, policy.assertion_marker);

    let mut combined_output = user_run.stdout.clone();
    let mut combined_stderr = user_run.stderr.clone();
    if let Some(run) = test_run {
        combined_output.push_str(&run.stdout);
        combined_stderr.push_str(&run.stderr);
    }

    let combined_error = match (verdict, test_run) {
        (Verdict::Success, Some(_)) => {
            if let Some(banner) = policy.pass_banner {
                combined_output.push_str(banner);
            }
            None
        }
        (Verdict::Success, None) | (Verdict::Attempted, _) => None,
        (_, Some(run)) if user_run.is_clean() => Some(non_empty_or(
            describe_failure(run, policy.timeout),
            "Test code reported a failed assertion.",
        )),
        _ => {
            let mut error = non_empty_or(
                describe_failure(user_run, policy.timeout),
                "User code failed.",
            );
            if test_supplied {
                push_line(&mut error, TEST_SKIPPED_NOTE);
            }
            Some(error)
        }
    };

    let returncode = test_run.unwrap_or(user_run).exit_code;

    ExecutionReport {
        combined_output,
        combined_stderr,
        combined_error,
        verdict,
        lint_output,
        returncode,
    }
}

/// Readable failure text for one run
fn describe_failure(run: &CapturedRun, timeout: Duration) -> String {
    if let Some(reason) = &run.transport_error {
        return format!("Sandbox unavailable: {reason}");
    }

    let mut text = run.stderr.clone();
    if run.timed_out {
        push_line(&mut text, &timeout_message(timeout));
    } else if text.is_empty() && run.exit_code != 0 {
        push_line(&mut text, &format!("Process exited with code {}.", run.exit_code));
    }
    text
}

fn push_line(text: &mut String, line: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text.push('\n');
}

fn non_empty_or(text: String, fallback: &str) -> String {
    if text.is_empty() {
        format!("{fallback}\n")
    } else {
        text
    }
}
