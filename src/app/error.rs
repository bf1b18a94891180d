use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_TRANSPORT: &str = "ERR_TRANSPORT";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_NOT_AUTHORIZED: &str = "ERR_NOT_AUTHORIZED";
pub const ERR_STATE_CONFLICT: &str = "ERR_STATE_CONFLICT";
pub const ERR_CANCELLED: &str = "ERR_CANCELLED";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    /// Bridge binary missing, daemon unreachable, or the device vanished mid-call.
    pub fn transport(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSPORT, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    pub fn not_authorized(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_NOT_AUTHORIZED, message, trace_id)
    }

    pub fn state_conflict(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_STATE_CONFLICT, message, trace_id)
    }

    pub fn cancelled(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CANCELLED, message, trace_id)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ERR_TIMEOUT
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ERR_CANCELLED
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = AppError::timeout("Command timed out", "trace-1");
        assert_eq!(err.to_string(), "Command timed out (ERR_TIMEOUT)");
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());
    }
}
