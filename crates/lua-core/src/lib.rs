//! `lua-core`: foundational types shared by the compiler and the VM.
//!
//! This crate defines:
//! - [`LuaValue`]: the dynamically-typed Lua value enum
//! - [`LuaError`]: the unified error type
//! - [`Proto`] / [`Closure`] / [`Upvalue`]: compiled functions and their runtime form
//! - The Lua 5.3 [`Instruction`] encoding
//! - [`LuaApi`]: the stack interface handed to native functions

pub mod api;
pub mod closure;
pub mod error;
pub mod opcode;
pub mod table;
pub mod value;

pub use api::{LuaApi, NativeFunction, ThreadStatus, MULTRET};
pub use closure::{Closure, LocVar, LuaClosure, NativeClosure, Proto, Upvalue, UpvalueDesc, UpvalueInner};
pub use error::LuaError;
pub use opcode::{Instruction, OpArg, OpCode, OpMode};
pub use table::{HashKey, LuaTable, TableRef};
pub use value::LuaValue;
