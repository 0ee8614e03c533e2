//! `lua-compiler`: compiles a Lua AST to Lua 5.3 register bytecode.

pub mod chunk;
pub mod compiler;
pub mod disasm;
mod expr;
mod func_state;
mod operand;
mod stmt;

pub use chunk::Chunk;
pub use compiler::{compile, Compiler};
pub use disasm::{disassemble, listing};
pub use func_state::{MAX_REGISTERS, MAX_UPVALUES};
