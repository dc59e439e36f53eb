use thiserror::Error;

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstructionError {
    #[error("Invalid length prefix: {0:?}")]
    BadLength(String),

    #[error("Element of {0} bytes exceeds the frame limit")]
    TooLong(usize),

    #[error("Truncated element")]
    Truncated,

    #[error("Missing instruction terminator")]
    MissingTerminator,

    #[error("Unexpected delimiter {0:?} after element")]
    UnexpectedDelimiter(char),

    #[error("Trailing data after instruction terminator")]
    TrailingData,

    #[error("Empty opcode")]
    EmptyOpcode,

    #[error("Instruction is not valid UTF-8")]
    InvalidUtf8,
}

/// Display tunnel errors
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Failed to reach display daemon at {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: expected opcode '{expected}', got '{actual}'")]
    UnexpectedOpcode { expected: String, actual: String },

    #[error("empty connection id")]
    EmptyConnectionId,

    #[error("closed tunnel")]
    ClosedTunnel,

    #[error("Protocol error: {0}")]
    Instruction(#[from] InstructionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_error_messages() {
        let err = DisplayError::UnexpectedOpcode {
            expected: "args".into(),
            actual: "error".into(),
        };
        assert_eq!(
            err.to_string(),
            "Protocol error: expected opcode 'args', got 'error'"
        );
        assert_eq!(DisplayError::ClosedTunnel.to_string(), "closed tunnel");
        assert_eq!(
            DisplayError::EmptyConnectionId.to_string(),
            "empty connection id"
        );
    }
}
