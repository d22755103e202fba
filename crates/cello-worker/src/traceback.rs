// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Formatting of errors bubbled up through the control channel.

/// What a failed execute response amounts to.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerFailure {
    /// The interpreter was interrupted, by the interrupt byte or an
    /// explicit abort.  Reported as a cancellation, never as an error.
    Cancelled,
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

/// Parse a control-channel error body.
///
/// A `KeyboardInterrupt` sentinel anywhere in the body, or `aborted = true`
/// from the caller's own abort flag, classifies as a cancellation.  A
/// multi-line body is a traceback whose last line splits into
/// `name: value`; a bare message becomes the value with a synthetic name.
pub fn classify_worker_error(message: &str, aborted: bool) -> WorkerFailure {
    if aborted || message.contains("KeyboardInterrupt") {
        return WorkerFailure::Cancelled;
    }

    let lines: Vec<&str> = message.lines().collect();
    if lines.len() > 1 {
        let last = lines.iter().rev().find(|l| !l.trim().is_empty()).copied().unwrap_or("");
        let (ename, evalue) = match last.split_once(':') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => ("ExecutionError".to_string(), last.trim().to_string()),
        };
        return WorkerFailure::Error {
            ename,
            evalue,
            traceback: lines.iter().map(|l| l.to_string()).collect(),
        };
    }

    WorkerFailure::Error {
        ename: "ExecutionError".to_string(),
        evalue: message.trim().to_string(),
        traceback: Vec::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_last_line_splits_into_name_and_value() {
        let body = "Traceback (most recent call last):\n  File \"<cell>\", line 1\nValueError: test";
        match classify_worker_error(body, false) {
            WorkerFailure::Error { ename, evalue, traceback } => {
                assert_eq!(ename, "ValueError");
                assert_eq!(evalue, "test");
                assert_eq!(traceback.len(), 3);
            }
            other => panic!("classified as {other:?}"),
        }
    }

    #[test]
    fn trailing_blank_lines_are_skipped_when_splitting() {
        let body = "Traceback (most recent call last):\nZeroDivisionError: division by zero\n\n";
        match classify_worker_error(body, false) {
            WorkerFailure::Error { ename, evalue, .. } => {
                assert_eq!(ename, "ZeroDivisionError");
                assert_eq!(evalue, "division by zero");
            }
            other => panic!("classified as {other:?}"),
        }
    }

    #[test]
    fn bare_message_gets_synthetic_name() {
        match classify_worker_error("worker exploded", false) {
            WorkerFailure::Error { ename, evalue, traceback } => {
                assert_eq!(ename, "ExecutionError");
                assert_eq!(evalue, "worker exploded");
                assert!(traceback.is_empty());
            }
            other => panic!("classified as {other:?}"),
        }
    }

    #[test]
    fn keyboard_interrupt_is_a_cancellation() {
        let body = "Traceback (most recent call last):\nKeyboardInterrupt";
        assert_eq!(classify_worker_error(body, false), WorkerFailure::Cancelled);
    }

    #[test]
    fn abort_flag_is_a_cancellation_regardless_of_body() {
        assert_eq!(classify_worker_error("ValueError: nope", true), WorkerFailure::Cancelled);
    }
}
