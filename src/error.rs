use std::fmt::Display;

use crate::provider::{CqErrEntry, Direction};

pub type Result<T> = std::result::Result<T, FabtestError>;

#[derive(Debug)]
pub enum FabtestError {
    /// Buffer allocation failed.
    Allocation { size: usize },
    /// The provider rejected a memory registration.
    Registration { code: i32 },
    /// Resource bring-up or address resolution failed.
    Setup { context: String, code: i32 },
    /// Neither a completion queue nor a counter is bound to the direction.
    NoCompletionSource(Direction),
    /// Queue resources are exhausted; retry after draining completions.
    TransientBusy,
    /// No progress within the idle window.
    Timeout,
    PostFailed { op: &'static str, code: i32 },
    Completion(CqErrEntry),
    IntegrityMismatch { iteration: u64, size: usize, offset: usize },
    Protocol(String),
    ConnectionClosed,
    NoData(String),
    NotImplemented(String),
    /// Result code reported by the remote side of a control session.
    Peer(i32),
    Io(std::io::Error),
    Config(String),
}

/// Outcome bucket a test case is tallied under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Success,
    NoData,
    NotImplemented,
    Error,
}

impl ErrorClass {
    pub fn from_code(code: i32) -> ErrorClass {
        match -code {
            0 => ErrorClass::Success,
            libc::ENODATA => ErrorClass::NoData,
            libc::ENOSYS => ErrorClass::NotImplemented,
            _ => ErrorClass::Error,
        }
    }

    pub fn of<T>(result: &Result<T>) -> ErrorClass {
        match result {
            Ok(_) => ErrorClass::Success,
            Err(e) => e.class(),
        }
    }
}

impl FabtestError {
    pub fn setup(context: impl Into<String>, code: i32) -> FabtestError {
        FabtestError::Setup { context: context.into(), code }
    }

    /// Negative errno value carried as the control-channel result word.
    pub fn code(&self) -> i32 {
        let errno = match self {
            FabtestError::Allocation { .. } => libc::ENOMEM,
            FabtestError::Registration { code } => code.abs(),
            FabtestError::Setup { code, .. } => code.abs(),
            FabtestError::NoCompletionSource(_) => libc::EINVAL,
            FabtestError::TransientBusy => libc::EAGAIN,
            FabtestError::Timeout => libc::ENODATA,
            FabtestError::PostFailed { code, .. } => code.abs(),
            FabtestError::Completion(entry) => entry.err.abs(),
            FabtestError::IntegrityMismatch { .. } => libc::EIO,
            FabtestError::Protocol(_) => libc::EPROTO,
            FabtestError::ConnectionClosed => libc::ENOTCONN,
            FabtestError::NoData(_) => libc::ENODATA,
            FabtestError::NotImplemented(_) => libc::ENOSYS,
            FabtestError::Peer(code) => code.abs(),
            FabtestError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FabtestError::Config(_) => libc::EINVAL,
        };
        if errno == 0 { -libc::EIO } else { -errno }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FabtestError::Timeout | FabtestError::NoData(_) => ErrorClass::NoData,
            FabtestError::NotImplemented(_) => ErrorClass::NotImplemented,
            FabtestError::Peer(code) => ErrorClass::from_code(*code),
            _ => ErrorClass::Error,
        }
    }
}

impl Display for FabtestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FabtestError::Allocation { size } => write!(f, "Error: failed to allocate {} bytes with code: {}", size, self.code()),
            FabtestError::Registration { code } => write!(f, "Error: memory registration with code: {}", code),
            FabtestError::Setup { context, code } => write!(f, "Error: {} with code: {}", context, code),
            FabtestError::NoCompletionSource(dir) => write!(f, "Error: no {} completion queue or counter opened", dir),
            FabtestError::TransientBusy => write!(f, "Error: resources temporarily unavailable"),
            FabtestError::Timeout => write!(f, "Error: timeout expired"),
            FabtestError::PostFailed { op, code } => write!(f, "Error: {} with code: {}", op, code),
            FabtestError::Completion(entry) => write!(f, "Error: completion {} (prov_errno {}) {}", entry.err, entry.prov_errno, entry.message),
            FabtestError::IntegrityMismatch { iteration, size, offset } => write!(f, "Error at iteration={} size={} byte={}", iteration, size, offset),
            FabtestError::Protocol(message) => write!(f, "Error: protocol violation: {}", message),
            FabtestError::ConnectionClosed => write!(f, "Error: connection closed by peer"),
            FabtestError::NoData(message) => write!(f, "Error: no data: {}", message),
            FabtestError::NotImplemented(message) => write!(f, "Error: not implemented: {}", message),
            FabtestError::Peer(code) => write!(f, "Error: peer reported code: {}", code),
            FabtestError::Io(e) => write!(f, "Error: {}", e),
            FabtestError::Config(message) => write!(f, "Error: config: {}", message),
        }
    }
}

impl std::error::Error for FabtestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FabtestError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FabtestError {
    fn from(e: std::io::Error) -> Self {
        FabtestError::Io(e)
    }
}

impl From<bincode::Error> for FabtestError {
    fn from(e: bincode::Error) -> Self {
        FabtestError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_tallied_as_no_data() {
        assert_eq!(FabtestError::Timeout.class(), ErrorClass::NoData);
        assert_eq!(FabtestError::Timeout.code(), -libc::ENODATA);
    }

    #[test]
    fn peer_codes_classify_through_errno() {
        assert_eq!(FabtestError::Peer(-libc::ENOSYS).class(), ErrorClass::NotImplemented);
        assert_eq!(FabtestError::Peer(-libc::EIO).class(), ErrorClass::Error);
        assert_eq!(ErrorClass::from_code(0), ErrorClass::Success);
    }

    #[test]
    fn codes_are_negative() {
        let errors = vec![
            FabtestError::Registration { code: libc::EACCES },
            FabtestError::setup("fi_av_insert", -libc::EINVAL),
            FabtestError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")),
            FabtestError::ConnectionClosed,
        ];
        for e in errors {
            assert!(e.code() < 0, "{}", e);
        }
    }
}
