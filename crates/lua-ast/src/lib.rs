//! `lua-ast`: the syntax tree handed from the parser to the compiler.

pub mod ast;
pub mod build;

pub use ast::{BinOp, Block, Expr, Field, FuncBody, FuncName, Line, ReturnStmt, Stmt, UnOp};
