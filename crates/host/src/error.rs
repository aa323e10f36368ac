//! Error taxonomy of the class bindings
//!
//! Raw controller statuses are translated here and never reach applications.

use common::usb_types::TransferStatus;
use std::time::Duration;
use thiserror::Error;

/// Why the controller reported a transfer as unsuccessful
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferFailure {
    #[error("transfer failed")]
    Failed,
    #[error("endpoint stalled")]
    Stalled,
    #[error("controller timed out")]
    ControllerTimeout,
    #[error("invalid transfer")]
    Invalid,
    #[error("controller rejected the request")]
    Rejected,
    #[error("short transfer")]
    Short,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsbhError {
    #[error("no such device")]
    NoDevice,

    #[error("device busy with a pending operation")]
    Busy,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    TransferFailed(TransferFailure),

    #[error("block {block} out of range (device has {count} blocks)")]
    OutOfRange { block: u32, count: u32 },

    #[error("buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("transfer buffer at {address:#x} is not 4-byte aligned")]
    Misaligned { address: usize },

    #[error("device is read-only")]
    ReadOnly,

    #[error("unsupported trigger {0:#x}")]
    UnsupportedTrigger(u32),

    #[error("report too large: {len} bytes (max {max})")]
    ReportTooLarge { len: usize, max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("USB host not active")]
    NotActive,

    #[error("host controller error: {0}")]
    Controller(String),
}

pub type Result<T> = std::result::Result<T, UsbhError>;

/// Translate a controller completion status into a binding result
pub fn map_transfer_status(status: TransferStatus) -> Result<()> {
    match status {
        TransferStatus::Success => Ok(()),
        TransferStatus::Failed => Err(UsbhError::TransferFailed(TransferFailure::Failed)),
        TransferStatus::Stalled => Err(UsbhError::TransferFailed(TransferFailure::Stalled)),
        TransferStatus::Timeout => Err(UsbhError::TransferFailed(
            TransferFailure::ControllerTimeout,
        )),
        TransferStatus::Invalid => Err(UsbhError::TransferFailed(TransferFailure::Invalid)),
    }
}

impl UsbhError {
    /// POSIX errno equivalent, for callers that surface numeric codes
    pub fn errno(&self) -> i32 {
        const EIO: i32 = 5;
        const EBUSY: i32 = 16;
        const ENODEV: i32 = 19;
        const EINVAL: i32 = 22;
        const EROFS: i32 = 30;
        const ETIMEDOUT: i32 = 110;

        match self {
            UsbhError::NoDevice | UsbhError::NotActive => ENODEV,
            UsbhError::Busy => EBUSY,
            UsbhError::Timeout(_) => ETIMEDOUT,
            UsbhError::TransferFailed(_) | UsbhError::Controller(_) => EIO,
            UsbhError::ReadOnly => EROFS,
            UsbhError::OutOfRange { .. }
            | UsbhError::BufferTooSmall { .. }
            | UsbhError::Misaligned { .. }
            | UsbhError::UnsupportedTrigger(_)
            | UsbhError::ReportTooLarge { .. }
            | UsbhError::InvalidArgument(_) => EINVAL,
        }
    }
}

impl From<UsbhError> for std::io::Error {
    fn from(err: UsbhError) -> Self {
        use std::io::ErrorKind;

        let kind = match err {
            UsbhError::NoDevice | UsbhError::NotActive => ErrorKind::NotConnected,
            UsbhError::Busy => ErrorKind::WouldBlock,
            UsbhError::Timeout(_) => ErrorKind::TimedOut,
            UsbhError::ReadOnly => ErrorKind::PermissionDenied,
            UsbhError::OutOfRange { .. }
            | UsbhError::BufferTooSmall { .. }
            | UsbhError::Misaligned { .. }
            | UsbhError::UnsupportedTrigger(_)
            | UsbhError::ReportTooLarge { .. }
            | UsbhError::InvalidArgument(_) => ErrorKind::InvalidInput,
            UsbhError::TransferFailed(_) | UsbhError::Controller(_) => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(map_transfer_status(TransferStatus::Success), Ok(()));
        assert_eq!(
            map_transfer_status(TransferStatus::Stalled),
            Err(UsbhError::TransferFailed(TransferFailure::Stalled))
        );
        assert_eq!(
            map_transfer_status(TransferStatus::Timeout),
            Err(UsbhError::TransferFailed(TransferFailure::ControllerTimeout))
        );
    }

    #[test]
    fn test_timeout_and_failure_are_distinct() {
        let timeout = UsbhError::Timeout(Duration::from_secs(1));
        let failed = UsbhError::TransferFailed(TransferFailure::Failed);
        assert_ne!(timeout, failed);
        assert_ne!(timeout.errno(), failed.errno());
    }

    #[test]
    fn test_io_error_kind() {
        let err: std::io::Error = UsbhError::NoDevice.into();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
        let err: std::io::Error = UsbhError::Timeout(Duration::from_millis(1)).into();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(UsbhError::NoDevice.errno(), 19);
        assert_eq!(UsbhError::ReadOnly.errno(), 30);
        assert_eq!(UsbhError::Busy.errno(), 16);
        assert_eq!(UsbhError::InvalidArgument("x").errno(), 22);
    }
}
