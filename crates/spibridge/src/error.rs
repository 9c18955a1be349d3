//! Error taxonomy surfaced to endpoint callers.

use std::io;

/// Errors returned by bridge operations.
///
/// Admission failures (`Timeout`, `Cancelled`) are only ever returned after the
/// caller's ticket has been retired, so a failing caller never holds up the queue.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The endpoint id or name does not exist.
    #[error("no such endpoint: {0}")]
    NotFound(String),

    /// The session has no backing handle (closed, or never opened).
    #[error("session has no backing device")]
    NotReady,

    /// The admission deadline elapsed before the ticket was granted.
    #[error("timed out waiting for admission")]
    Timeout,

    /// An external cancellation arrived while the caller was queued.
    #[error("admission cancelled")]
    Cancelled,

    /// The backing device has no implementation for the control request.
    #[error("control request {code:#x} not supported")]
    NotSupported { code: u32 },

    /// Error reported by the backing device during a granted operation.
    #[error("backing device error: {0}")]
    Upstream(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error (e.g., a blocking task panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Classify an error from the backing device for a control request.
    ///
    /// "Not a typewriter" from the device and `Unsupported` from in-process
    /// backings both mean the request has no implementation.
    pub fn from_control(code: u32, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::Unsupported || is_enotty(&err) {
            Self::NotSupported { code }
        } else {
            Self::Upstream(err)
        }
    }

    /// True for the two deferred admission failures.
    pub fn is_admission_failure(&self) -> bool {
        matches!(self, Self::Timeout | Self::Cancelled)
    }

    /// The errno a character-device caller would have seen for this error.
    #[cfg(unix)]
    pub fn errno(&self) -> nix::errno::Errno {
        use nix::errno::Errno;

        match self {
            Self::NotFound(_) => Errno::ENXIO,
            Self::NotReady => Errno::ENODEV,
            Self::Timeout => Errno::ETIMEDOUT,
            Self::Cancelled => Errno::EINTR,
            Self::NotSupported { .. } => Errno::ENOTTY,
            Self::Upstream(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            Self::InvalidConfig(_) => Errno::EINVAL,
            Self::Internal(_) => Errno::EIO,
        }
    }
}

#[cfg(unix)]
fn is_enotty(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ENOTTY as i32)
}

#[cfg(not(unix))]
fn is_enotty(_err: &io::Error) -> bool {
    false
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_kind_maps_to_not_supported() {
        let err = BridgeError::from_control(0x42, io::Error::from(io::ErrorKind::Unsupported));
        assert!(matches!(err, BridgeError::NotSupported { code: 0x42 }));
    }

    #[test]
    fn other_control_errors_pass_through() {
        let err = BridgeError::from_control(1, io::Error::other("bus fault"));
        match err {
            BridgeError::Upstream(e) => assert_eq!(e.to_string(), "bus fault"),
            other => panic!("expected Upstream, got {other:?}"),
        }
    }

    #[test]
    fn admission_failures() {
        assert!(BridgeError::Timeout.is_admission_failure());
        assert!(BridgeError::Cancelled.is_admission_failure());
        assert!(!BridgeError::NotReady.is_admission_failure());
    }

    #[cfg(unix)]
    #[test]
    fn errno_mapping() {
        use nix::errno::Errno;

        assert_eq!(BridgeError::NotReady.errno(), Errno::ENODEV);
        assert_eq!(BridgeError::Timeout.errno(), Errno::ETIMEDOUT);
        assert_eq!(BridgeError::Cancelled.errno(), Errno::EINTR);
        assert_eq!(BridgeError::NotSupported { code: 7 }.errno(), Errno::ENOTTY);
        assert_eq!(
            BridgeError::Upstream(io::Error::from_raw_os_error(Errno::EBUSY as i32)).errno(),
            Errno::EBUSY
        );
        assert_eq!(
            BridgeError::Upstream(io::Error::other("opaque")).errno(),
            Errno::EIO
        );
    }

    #[cfg(unix)]
    #[test]
    fn enotty_from_device_is_not_supported() {
        let err = io::Error::from_raw_os_error(nix::errno::Errno::ENOTTY as i32);
        assert!(matches!(
            BridgeError::from_control(9, err),
            BridgeError::NotSupported { code: 9 }
        ));
    }
}
