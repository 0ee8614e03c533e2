//! `lua-vm`: call engine and instruction dispatch for compiled Lua chunks.
//!
//! [`LuaState`] owns the frame stack and the globals table and implements
//! [`lua_core::LuaApi`] for host code and native functions:
//!
//! ```ignore
//! let chunk = lua_compiler::compile(&block, "main")?;
//! let mut lua = LuaState::new();
//! let results = lua.execute(&chunk)?;
//! ```

mod arith;
pub mod config;
mod exec;
mod meta;
mod stack;
pub mod state;
pub mod stdlib;

pub use config::VmConfig;
pub use state::LuaState;
