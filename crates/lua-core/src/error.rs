use crate::value::LuaValue;
use thiserror::Error;

/// All errors that can occur while compiling or running Lua code.
#[derive(Debug, Error, PartialEq)]
pub enum LuaError {
    /// The compiler rejected the tree (register overflow, `break` outside a loop, ...).
    #[error("compile error at line {line}: {message}")]
    Compile { line: u32, message: String },

    /// A runtime error raised by instruction execution.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Wrong type used for an operation.
    #[error("attempt to {op} a {got} value")]
    TypeError { op: &'static str, got: &'static str },

    /// The callee is neither a closure nor has a `__call` metamethod.
    #[error("attempt to call a {0} value")]
    NotCallable(&'static str),

    /// Call depth exceeded the configured limit.
    #[error("stack overflow")]
    StackOverflow,

    /// A value raised by running code (`error(v)`).
    #[error("{0}")]
    Value(LuaValue),

    /// An API entry point that is deliberately not implemented.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Internal implementation bug; should never surface to users.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LuaError {
    pub fn compile(line: u32, message: impl Into<String>) -> Self {
        LuaError::Compile {
            line,
            message: message.into(),
        }
    }
}
