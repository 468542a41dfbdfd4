#![forbid(unsafe_code)]

//! Error taxonomy for the pipeline stages.
//!
//! Every variant maps onto a [`FailureClass`], which is all the shared retry
//! policy looks at when deciding whether to back off, give up, or skip.

use std::path::PathBuf;

use thiserror::Error;

/// How the retry policy should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry after a short randomized delay.
    Transient,
    /// Anti-automation response. Retry after a long delay with its own budget.
    Blocked,
    /// Retrying cannot help.
    Terminal,
    /// Deliberate skip, not a failure.
    Skip,
}

#[derive(Error, Debug)]
pub enum HarvestError {
    /// Timeouts, connection resets and 5xx responses.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// The platform refused the request (HTTP 412/429 or an equivalent body code).
    #[error("blocked by anti-automation protection (status {status})")]
    Blocked { status: i64 },

    /// Malformed or unexpected payload from the search provider.
    #[error("unexpected provider data: {0}")]
    ProviderDataAnomaly(String),

    #[error("media size {size_mb:.2} MB exceeds the {cap_mb:.0} MB cap")]
    OversizedMedia { size_mb: f64, cap_mb: f64 },

    /// The fetch tool or encoder exited non-zero, timed out, or left no output.
    #[error("{tool} failed: {detail}")]
    ExternalTool { tool: String, detail: String },

    #[error("ledger I/O failure at {}: {detail}", path.display())]
    LedgerIo { path: PathBuf, detail: String },

    #[error("credential unavailable: {0}")]
    Credential(String),

    /// Shutdown was requested while an operation was between attempts.
    #[error("interrupted before the next attempt")]
    Interrupted,
}

impl HarvestError {
    pub fn class(&self) -> FailureClass {
        match self {
            HarvestError::TransientNetwork(_) | HarvestError::ExternalTool { .. } => {
                FailureClass::Transient
            }
            HarvestError::Blocked { .. } => FailureClass::Blocked,
            HarvestError::OversizedMedia { .. } => FailureClass::Skip,
            HarvestError::ProviderDataAnomaly(_)
            | HarvestError::LedgerIo { .. }
            | HarvestError::Credential(_)
            | HarvestError::Interrupted => FailureClass::Terminal,
        }
    }

    pub(crate) fn tool(tool: &str, detail: impl Into<String>) -> Self {
        HarvestError::ExternalTool {
            tool: tool.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn ledger(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        HarvestError::LedgerIo {
            path: path.into(),
            detail: err.to_string(),
        }
    }
}

/// Maps a ureq failure onto the taxonomy. 412 is what the platform answers
/// when it decides a client looks automated.
impl From<ureq::Error> for HarvestError {
    fn from(error: ureq::Error) -> Self {
        match error {
            ureq::Error::Status(code, _) => match code {
                412 | 429 => HarvestError::Blocked {
                    status: i64::from(code),
                },
                408 | 500 | 502 | 503 | 504 => {
                    HarvestError::TransientNetwork(format!("server answered {code}"))
                }
                _ => HarvestError::ProviderDataAnomaly(format!("unexpected status {code}")),
            },
            ureq::Error::Transport(transport) => {
                HarvestError::TransientNetwork(transport.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_cover_the_taxonomy() {
        assert_eq!(
            HarvestError::TransientNetwork("reset".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            HarvestError::Blocked { status: 412 }.class(),
            FailureClass::Blocked
        );
        assert_eq!(
            HarvestError::OversizedMedia {
                size_mb: 700.0,
                cap_mb: 500.0
            }
            .class(),
            FailureClass::Skip
        );
        assert_eq!(
            HarvestError::tool("encoder", "exit status 1").class(),
            FailureClass::Transient
        );
        assert_eq!(
            HarvestError::ledger("/tmp/x.csv", "denied").class(),
            FailureClass::Terminal
        );
        assert_eq!(HarvestError::Interrupted.class(), FailureClass::Terminal);
    }

    #[test]
    fn oversized_message_is_readable() {
        let err = HarvestError::OversizedMedia {
            size_mb: 612.5,
            cap_mb: 500.0,
        };
        assert_eq!(err.to_string(), "media size 612.50 MB exceeds the 500 MB cap");
    }
}
