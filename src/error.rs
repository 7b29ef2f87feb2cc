//! Device error taxonomy

use std::io;

/// Error tagged at the platform port or higher
#[derive(thiserror::Error, Clone, Debug)]
pub(crate) enum DeviceError {
    /// Device path absent
    #[error("Device not found: {0}")]
    NotFound(String),
    /// Cannot open device
    #[error("Access denied: {0}")]
    AccessDenied(String),
    /// Pass-through failed or sense reported a non-recoverable condition
    #[error("I/O error: {0}")]
    Io(String),
    /// Unexpected response shape
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Dialect or transport cannot encode this request
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// User-side error: out-of-range ports, disk indices, test spans
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Another SCT or self-test command is in progress
    #[error("Device busy: {0}")]
    Busy(String),
    /// Page checksum failed, subject to the checksum policy
    #[error("Checksum error: {0}")]
    Checksum(String),
}

impl DeviceError {
    /// Map an OS error from opening or driving a device path
    pub(crate) fn from_os(path: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(format!("{path}: {err}")),
            io::ErrorKind::PermissionDenied => Self::AccessDenied(format!("{path}: {err}")),
            _ => Self::Io(format!("{path}: {err}")),
        }
    }
}

/// Checksum failure handling, selectable from the command line
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum ChecksumPolicy {
    /// Log a warning and continue
    #[default]
    Warn,
    /// Treat as a fatal error
    Exit,
    /// Silently ignore
    Ignore,
}

impl ChecksumPolicy {
    /// Apply policy to a failed page checksum.
    /// Returned data is never mutated, only the error path varies.
    pub(crate) fn apply(self, what: &str) -> Result<(), DeviceError> {
        match self {
            Self::Warn => {
                log::warn!("Checksum error in {what}");
                Ok(())
            }
            Self::Exit => Err(DeviceError::Checksum(what.to_owned())),
            Self::Ignore => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_mapping() {
        let err = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(
            DeviceError::from_os("/dev/sdx", &err),
            DeviceError::NotFound(_)
        ));
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            DeviceError::from_os("/dev/sdx", &err),
            DeviceError::AccessDenied(_)
        ));
        let err = io::Error::from(io::ErrorKind::TimedOut);
        assert!(matches!(
            DeviceError::from_os("/dev/sdx", &err),
            DeviceError::Io(_)
        ));
    }

    #[test]
    fn checksum_policy_parse() {
        assert_eq!(
            "warn".parse::<ChecksumPolicy>().ok(),
            Some(ChecksumPolicy::Warn)
        );
        assert_eq!(
            "exit".parse::<ChecksumPolicy>().ok(),
            Some(ChecksumPolicy::Exit)
        );
        assert_eq!(
            "ignore".parse::<ChecksumPolicy>().ok(),
            Some(ChecksumPolicy::Ignore)
        );
    }

    #[test]
    fn checksum_policy_apply() {
        assert!(ChecksumPolicy::Warn.apply("test page").is_ok());
        assert!(ChecksumPolicy::Ignore.apply("test page").is_ok());
        assert!(matches!(
            ChecksumPolicy::Exit.apply("test page"),
            Err(DeviceError::Checksum(_))
        ));
    }
}
