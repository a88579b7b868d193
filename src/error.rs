use crate::bytecode::Instruction;
use std::fmt;
use std::io;
use thiserror::Error;

/// An error raised while executing instructions. Every variant except
/// `StackUnderflow` is recoverable: a handler region covering the
/// faulting instruction intercepts it and the program continues.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("type error: {0}")]
    TypeError(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("cast error: {0}")]
    CastError(String),

    #[error("index {index} out of bounds for length {len}")]
    IndexError { index: i64, len: usize },

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("stack overflow: limit of {0} exceeded")]
    StackOverflow(usize),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("io error: {0}")]
    IoError(String),
}

impl RuntimeError {
    /// The name a handler region sees on the stack when it catches
    /// this error.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RuntimeError::TypeError(_) => "TypeError",
            RuntimeError::DivisionByZero => "DivisionByZero",
            RuntimeError::CastError(_) => "CastError",
            RuntimeError::IndexError { .. } => "IndexError",
            RuntimeError::FieldNotFound(_) => "FieldNotFound",
            RuntimeError::MethodNotFound(_) => "MethodNotFound",
            RuntimeError::StackOverflow(_) => "StackOverflow",
            RuntimeError::StackUnderflow => "StackUnderflow",
            RuntimeError::IoError(_) => "IOError",
        }
    }

    /// Stack underflow means the instruction stream itself is broken;
    /// resuming a handler over a corrupt operand stack would only move
    /// the crash somewhere harder to read.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, RuntimeError::StackUnderflow)
    }
}

impl From<io::Error> for RuntimeError {
    fn from(error: io::Error) -> Self {
        RuntimeError::IoError(error.to_string())
    }
}

/// An error raised while decoding or validating a program image.
/// Load errors are always fatal; nothing has started executing yet.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("not a program image (bad magic)")]
    InvalidMagic,

    #[error("unsupported image version: {0}")]
    UnsupportedVersion(u8),

    #[error("image truncated")]
    Truncated,

    #[error("unknown opcode byte: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("malformed image: {0}")]
    Malformed(String),

    #[error("type table rejected image: {0}")]
    TypeTable(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One entry of a captured call stack, innermost frame first.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTrace {
    pub function: String,
    pub ip: usize,
}

/// What the VM reports when no handler region caught a runtime error:
/// the error itself, the instruction that raised it, and the call
/// stack at the moment it was raised.
#[derive(Debug)]
pub struct Diagnostic {
    pub error: RuntimeError,
    pub instruction: Option<Instruction>,
    pub trace: Vec<FrameTrace>,
}

impl Diagnostic {
    pub fn new(error: RuntimeError) -> Self {
        Self {
            error,
            instruction: None,
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "runtime error: {}", self.error)?;
        if let Some(instruction) = &self.instruction {
            write!(formatter, "\n  while executing: {}", instruction)?;
        }
        if !self.trace.is_empty() {
            write!(formatter, "\ncall stack (innermost first):")?;
            for frame in &self.trace {
                write!(formatter, "\n  {} at ip {}", frame.function, frame.ip)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    #[test]
    fn kind_names_match_handler_contract() {
        assert_eq!(RuntimeError::DivisionByZero.kind_name(), "DivisionByZero");
        assert_eq!(
            RuntimeError::IoError("disk on fire".into()).kind_name(),
            "IOError"
        );
        assert_eq!(
            RuntimeError::IndexError { index: 7, len: 3 }.kind_name(),
            "IndexError"
        );
    }

    #[test]
    fn only_underflow_is_fatal() {
        assert!(!RuntimeError::StackUnderflow.is_recoverable());
        assert!(RuntimeError::DivisionByZero.is_recoverable());
        assert!(RuntimeError::StackOverflow(128).is_recoverable());
        assert!(RuntimeError::TypeError("x".into()).is_recoverable());
    }

    #[test]
    fn diagnostic_report_lists_frames_innermost_first() {
        let diagnostic = Diagnostic {
            error: RuntimeError::DivisionByZero,
            instruction: Some(Instruction::new(Opcode::Div, 0)),
            trace: vec![
                FrameTrace {
                    function: "inner".into(),
                    ip: 4,
                },
                FrameTrace {
                    function: "main".into(),
                    ip: 2,
                },
            ],
        };
        let report = diagnostic.to_string();
        assert!(report.starts_with("runtime error: division by zero"));
        assert!(report.contains("while executing: DIV 0"));
        let inner = report.find("inner at ip 4").unwrap();
        let main = report.find("main at ip 2").unwrap();
        assert!(inner < main);
    }

    #[test]
    fn io_errors_convert_with_message() {
        let error: RuntimeError =
            io::Error::new(io::ErrorKind::NotFound, "no such file").into();
        assert!(matches!(error, RuntimeError::IoError(_)));
        assert!(error.to_string().contains("no such file"));
    }
}
