// File: src/errors.rs
//
// Error reporting for Lume. Compile errors are collected as structured
// diagnostics and rendered `[line N] Error at 'x': message`; runtime
// errors carry the call-stack trace the VM captured when they fired.

use colored::Colorize;
use std::fmt;

/// A single compile-time diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    /// The offending lexeme, `None` at end of input.
    pub lexeme: Option<String>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let location = format!("[line {}]", self.line);
        write!(f, "{} {}", location.bright_blue(), "Error".red().bold())?;
        match &self.lexeme {
            Some(lexeme) => write!(f, " at '{}'", lexeme)?,
            None => write!(f, " at end")?,
        }
        write!(f, ": {}", self.message)
    }
}

/// One frame of a runtime stack trace, deepest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: usize,
    /// `None` for the top-level script.
    pub function: Option<String>,
}

/// A runtime error plus the trace of frames that were live when it was
/// raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> RuntimeError {
        RuntimeError { message: message.into(), trace: Vec::new() }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.message.red().bold())?;
        for frame in &self.trace {
            let location = format!("[line {}]", frame.line);
            match &frame.function {
                Some(name) => writeln!(f, "{} in {}()", location.bright_blue(), name)?,
                None => writeln!(f, "{} in script", location.bright_blue())?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Top-level interpreter outcome.
#[derive(Debug)]
pub enum LumeError {
    Compile(Vec<Diagnostic>),
    Runtime(RuntimeError),
}

impl LumeError {
    /// Conventional process exit code: 65 for compile errors, 70 for
    /// runtime errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            LumeError::Compile(_) => 65,
            LumeError::Runtime(_) => 70,
        }
    }
}

impl fmt::Display for LumeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LumeError::Compile(diagnostics) => {
                for diagnostic in diagnostics {
                    writeln!(f, "{}", diagnostic)?;
                }
                Ok(())
            }
            LumeError::Runtime(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for LumeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_renders_compile_error_format() {
        colored::control::set_override(false);
        let d = Diagnostic {
            line: 3,
            lexeme: Some("}".to_string()),
            message: "Expect expression.".to_string(),
        };
        assert_eq!(d.to_string(), "[line 3] Error at '}': Expect expression.");

        let at_end =
            Diagnostic { line: 7, lexeme: None, message: "Expect ';' after value.".to_string() };
        assert_eq!(at_end.to_string(), "[line 7] Error at end: Expect ';' after value.");
    }

    #[test]
    fn runtime_error_renders_trace_deepest_first() {
        colored::control::set_override(false);
        let e = RuntimeError {
            message: "Operands must be numbers.".to_string(),
            trace: vec![
                TraceFrame { line: 2, function: Some("inner".to_string()) },
                TraceFrame { line: 5, function: None },
            ],
        };
        assert_eq!(
            e.to_string(),
            "Operands must be numbers.\n[line 2] in inner()\n[line 5] in script\n"
        );
    }
}
