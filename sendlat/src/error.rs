//! Error taxonomy shared by every component, and the process exit code for each category.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::fabric::WcStatus;

/// Send/receive/credit counters at the point a run failed.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Counters {
    /// Sends posted so far.
    pub scnt: usize,
    /// Receives posted so far.
    pub rcnt: usize,
    /// Unsignaled sends since the last signaled one.
    pub ccnt: usize,
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scnt={}, rcnt={}, ccnt={}", self.scnt, self.rcnt, self.ccnt)
    }
}

/// Everything that can abort a run or a connection.
#[derive(Debug, Error)]
pub enum Error {
    /// A command-line value is out of range; nothing has been allocated yet.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No device matched the selector, or the device list is empty.
    #[error("{}", device_not_found(.0))]
    DeviceNotFound(Option<String>),

    /// Creating a fabric resource failed.
    #[error("couldn't create {what}: {source}")]
    ResourceExhausted {
        /// The resource that could not be created.
        what: &'static str,
        /// The provider's error.
        #[source]
        source: io::Error,
    },

    /// Pinning or registering a buffer was rejected.
    #[error("couldn't register {len} byte buffer: {source}")]
    RegistrationFailed {
        /// Requested length.
        len: usize,
        /// The provider's error.
        #[source]
        source: io::Error,
    },

    /// A connection request arrived on a device other than the one already in use.
    #[error("cannot handle events in more than one context (have {have}, request on {got})")]
    MultiContext {
        /// Device the context was built on.
        have: String,
        /// Device of the offending request.
        got: String,
    },

    /// The out-of-band exchange failed.
    #[error("handshake failed during {stage}: {reason}")]
    HandshakeFailed {
        /// Step of the exchange that failed.
        stage: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// A transition that does not follow the allowed order.
    #[error("illegal transition from {from} on {to}")]
    StateViolation {
        /// State before the attempted transition.
        from: String,
        /// Requested state or event.
        to: String,
    },

    /// The provider rejected a posted work request.
    #[error("couldn't post {what}: {counters}: {source}")]
    QueueFull {
        /// `"send"` or `"receive"`.
        what: &'static str,
        /// Counters at the time of the post.
        counters: Counters,
        /// The provider's error.
        #[source]
        source: io::Error,
    },

    /// A work request completed with a non-success status.
    #[error("completion with error at {side}: failed status {status}: wr_id {wr_id}: {counters}")]
    Completion {
        /// `"client"` or `"server"`.
        side: &'static str,
        /// Completion status.
        status: WcStatus,
        /// Correlation id of the failed request.
        wr_id: u64,
        /// Counters at the time of the failure.
        counters: Counters,
    },

    /// Polling a completion queue or waiting on a completion channel failed.
    #[error("{what} failed: {source}")]
    Poll {
        /// The failing operation.
        what: &'static str,
        /// The provider's error.
        #[source]
        source: io::Error,
    },

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn device_not_found(name: &Option<String>) -> String {
    match name {
        Some(name) => format!("IB device {name} not found"),
        None => "No IB devices found".to_string(),
    }
}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn resource(what: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::ResourceExhausted { what, source }
    }

    pub(crate) fn handshake(stage: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |e| Error::HandshakeFailed {
            stage,
            reason: e.to_string(),
        }
    }

    pub(crate) fn poll(what: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Poll { what, source }
    }

    /// Process exit code for this error's category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::DeviceNotFound(_) => 7,
            Error::ResourceExhausted { .. }
            | Error::RegistrationFailed { .. }
            | Error::MultiContext { .. } => 8,
            Error::HandshakeFailed { .. } => 9,
            Error::Io(_) => 10,
            Error::QueueFull { .. } => 11,
            Error::Poll { .. } => 12,
            Error::Completion { .. } => 13,
            Error::StateViolation { .. } => 14,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let io = || io::Error::from_raw_os_error(12);
        let errors = vec![
            Error::Config("x".into()),
            Error::DeviceNotFound(None),
            Error::ResourceExhausted {
                what: "PD",
                source: io(),
            },
            Error::HandshakeFailed {
                stage: "read",
                reason: "eof".into(),
            },
            Error::Io(io()),
            Error::QueueFull {
                what: "send",
                counters: Counters::default(),
                source: io(),
            },
            Error::Poll {
                what: "poll",
                source: io(),
            },
            Error::Completion {
                side: "client",
                status: WcStatus::RetryExceeded,
                wr_id: 1,
                counters: Counters::default(),
            },
            Error::StateViolation {
                from: "RESET".into(),
                to: "RTR".into(),
            },
        ];
        let mut codes: Vec<_> = errors.iter().map(Error::exit_code).collect();
        assert!(codes.iter().all(|&c| c > 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn completion_error_reports_counters() {
        let e = Error::Completion {
            side: "server",
            status: WcStatus::WrFlush,
            wr_id: 2,
            counters: Counters {
                scnt: 3,
                rcnt: 4,
                ccnt: 1,
            },
        };
        let msg = e.to_string();
        assert!(msg.contains("wr_id 2"), "{msg}");
        assert!(msg.contains("scnt=3, rcnt=4, ccnt=1"), "{msg}");
    }

    #[test]
    fn device_not_found_messages() {
        assert_eq!(
            Error::DeviceNotFound(None).to_string(),
            "No IB devices found"
        );
        assert_eq!(
            Error::DeviceNotFound(Some("mlx5_0".into())).to_string(),
            "IB device mlx5_0 not found"
        );
    }
}
