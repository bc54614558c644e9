//! Run failure taxonomy shared by every delivery strategy.

use thiserror::Error;

/// Exit code reported when the process never produced a real one.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `ExecErrorKind` values.
pub enum ExecErrorKind {
    /// The process could not be launched or communicated with.
    Start,
    /// The process launched but exited non-zero or was killed.
    Runtime,
    /// The response sink stopped accepting output.
    Transport,
}

impl ExecErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Runtime => "runtime",
            Self::Transport => "transport",
        }
    }
}

#[derive(Debug, Error)]
/// Enumerates failures of a single run.
pub enum ExecError {
    #[error("failed to start command '{program}': {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to communicate with command: {0}")]
    Io(#[source] std::io::Error),
    #[error("exit status {code}")]
    Exited { code: i32 },
    #[error("signal: {}", signal_name(.signal))]
    Signaled { signal: i32 },
    #[error("command timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
    #[error("command cancelled before completion")]
    Cancelled,
    #[error("response stream closed before command finished")]
    Transport,
}

impl ExecError {
    pub fn kind(&self) -> ExecErrorKind {
        match self {
            Self::Start { .. } | Self::Io(_) => ExecErrorKind::Start,
            Self::Exited { .. } | Self::Signaled { .. } | Self::TimedOut { .. } | Self::Cancelled => {
                ExecErrorKind::Runtime
            }
            Self::Transport => ExecErrorKind::Transport,
        }
    }

    /// The OS-reported exit code, or `-1` when none exists.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited { code } => *code,
            _ => UNKNOWN_EXIT_CODE,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::Cancelled)
    }
}

fn signal_name(signal: &i32) -> String {
    let name = match *signal {
        1 => "hangup",
        2 => "interrupt",
        3 => "quit",
        6 => "aborted",
        9 => "killed",
        11 => "segmentation fault",
        13 => "broken pipe",
        15 => "terminated",
        _ => return format!("signal {signal}"),
    };
    name.to_string()
}
