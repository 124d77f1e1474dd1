/// Run outcome classification
///
/// A pure function over the launch outcome. Judge-side teardown takes
/// precedence over the exit status, since a killed payload also exits
/// non-zero.
use crate::config::types::{SandboxFailureKind, UpletError};
use crate::core::types::SandboxLaunchOutcome;
use crate::sandbox::RunPhase;

/// Bytes of stderr quoted in failure messages
const STDERR_TAIL: usize = 2048;

#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Completed,
    Timeout { canceled: bool },
    SetupFailure(String),
    ExecutionFailure(String),
}

impl Verdict {
    /// Terminal run phase for this verdict
    pub fn phase(&self) -> RunPhase {
        match self {
            Verdict::Completed => RunPhase::Completed,
            Verdict::Timeout { .. } => RunPhase::TimedOut,
            Verdict::SetupFailure(_) | Verdict::ExecutionFailure(_) => RunPhase::Crashed,
        }
    }

    pub fn into_result(self) -> crate::config::types::Result<()> {
        match self {
            Verdict::Completed => Ok(()),
            Verdict::Timeout { canceled: true } => Err(UpletError::sandbox(
                SandboxFailureKind::Timeout,
                "run canceled",
            )),
            Verdict::Timeout { canceled: false } => Err(UpletError::sandbox(
                SandboxFailureKind::Timeout,
                "deadline exceeded",
            )),
            Verdict::SetupFailure(msg) => {
                Err(UpletError::sandbox(SandboxFailureKind::SetupFailure, msg))
            }
            Verdict::ExecutionFailure(msg) => {
                Err(UpletError::sandbox(SandboxFailureKind::ExecutionFailure, msg))
            }
        }
    }
}

pub struct VerdictClassifier;

impl VerdictClassifier {
    pub fn classify(outcome: &SandboxLaunchOutcome) -> Verdict {
        let status = &outcome.status;

        // the payload never reached exec
        if let Some(err) = &status.setup_error {
            return Verdict::SetupFailure(format!("sandbox setup failed: {}", err));
        }
        if let Some(err) = &status.internal_error {
            return Verdict::SetupFailure(format!("sandbox proxy failed: {}", err));
        }

        if outcome.timed_out || status.timed_out {
            return Verdict::Timeout {
                canceled: outcome.canceled,
            };
        }

        if let Some(signal) = status.term_signal {
            return Verdict::ExecutionFailure(format!(
                "killed by signal {}{}",
                signal,
                stderr_tail(&status.stderr)
            ));
        }

        match status.exit_code {
            Some(0) => Verdict::Completed,
            Some(code) => Verdict::ExecutionFailure(format!(
                "exited with status {}{}",
                code,
                stderr_tail(&status.stderr)
            )),
            None => Verdict::SetupFailure("payload exit status unavailable".to_string()),
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut start = trimmed.len().saturating_sub(STDERR_TAIL);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!(": {}", &trimmed[start..])
}
