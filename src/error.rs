use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Missing reference, annotation, output folder or inputs; nothing was scheduled.
    Precondition,
    /// Another stage holds the scheduler slot.
    Busy,
    ExternalTool,
    Persistence,
    Metadata,
    InvalidInput,
    Io,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub code: ErrorCode,
    pub message: String,
}

impl PipelineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Precondition, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Busy, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Persistence, message)
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Metadata, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Error for PipelineError {}

/// Raised by external collaborators when a subprocess exits non-zero or
/// reports success without producing its output.
#[derive(Debug, Clone)]
pub struct ExternalToolError {
    pub executable: String,
    pub args: Vec<String>,
    pub status: Option<i32>,
    pub stderr: String,
}

impl fmt::Display for ExternalToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' failed (exit={:?}) with args [{}]: {}",
            self.executable,
            self.status,
            self.args.join(" "),
            self.stderr.trim()
        )
    }
}

impl Error for ExternalToolError {}

impl From<ExternalToolError> for PipelineError {
    fn from(err: ExternalToolError) -> Self {
        PipelineError::new(ErrorCode::ExternalTool, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contains_code_and_message() {
        let err = PipelineError::precondition("no reference genome");
        assert_eq!(err.to_string(), "Precondition: no reference genome");
        assert!(err.is(ErrorCode::Precondition));
    }

    #[test]
    fn test_external_tool_error_maps_to_code() {
        let err = ExternalToolError {
            executable: "bwa".to_string(),
            args: vec!["index".to_string(), "ref.fa".to_string()],
            status: Some(1),
            stderr: "  [bwa_index] fail to open file\n".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("bwa"));
        assert!(text.contains("index ref.fa"));
        assert!(text.ends_with("fail to open file"));
        let mapped: PipelineError = err.into();
        assert_eq!(mapped.code, ErrorCode::ExternalTool);
    }
}
