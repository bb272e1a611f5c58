use crate::inference::Mode;
use thiserror::Error;

/// Shown when the camera cannot be opened. There is no retry.
pub const CAMERA_DISCLOSURE: &str =
    "A camera is required. Grant camera access and make sure a device is connected, then restart.";

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera access was denied")]
    PermissionDenied,
    #[error("no camera device found")]
    NoDevice,
    #[error("camera backend failure: {0}")]
    Backend(String),
}

impl CameraError {
    /// Sorts a backend error message into the camera taxonomy.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("not permitted") || lower.contains("eacces") {
            CameraError::PermissionDenied
        } else if lower.contains("no such device") || lower.contains("no such file") {
            CameraError::NoDevice
        } else {
            CameraError::Backend(message)
        }
    }
}

/// A model pipeline failed to load. Cloneable so every waiter on the
/// memoized load sees the same failure.
#[derive(Debug, Clone, Error)]
#[error("{mode} model failed to load: {reason}")]
pub struct ModelLoadError {
    pub mode: Mode,
    pub reason: String,
}

impl ModelLoadError {
    pub fn new(mode: Mode, reason: impl std::fmt::Display) -> Self {
        Self {
            mode,
            reason: reason.to_string(),
        }
    }
}
