//! Operand classification: decides whether an expression can be used
//! in place as an instruction operand or has to be evaluated first.

use crate::compiler::Compiler;
use lua_ast::Expr;
use lua_core::opcode::{rk_const, MAXINDEXRK};
use lua_core::{LuaError, LuaValue};

/// Where an expression's value can be read from without evaluating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    /// Constant-pool entry, already RK-encoded.
    Constant(u32),
    /// A local's register.
    Register(u8),
    Upvalue(u8),
    /// A free name, i.e. `_ENV[name]`.
    Global,
    /// Anything else; must be evaluated into a register.
    Temp,
}

impl Operand {
    /// The RK operand for a constant or register, `None` otherwise.
    pub(crate) fn rk(self) -> Option<u32> {
        match self {
            Operand::Constant(k) => Some(k),
            Operand::Register(r) => Some(r as u32),
            _ => None,
        }
    }
}

impl Compiler {
    /// Classify `expr`. Literals are interned; names are resolved (capturing
    /// enclosing locals as upvalues when needed).
    pub(crate) fn classify(&mut self, expr: &Expr) -> Result<Operand, LuaError> {
        let op = match expr {
            Expr::Nil(_) => self.constant_operand(LuaValue::Nil),
            Expr::True(_) => self.constant_operand(LuaValue::Boolean(true)),
            Expr::False(_) => self.constant_operand(LuaValue::Boolean(false)),
            Expr::Integer(n, _) => self.constant_operand(LuaValue::Integer(*n)),
            Expr::Float(n, _) => self.constant_operand(LuaValue::Float(*n)),
            Expr::LuaString(s, _) => self.constant_operand(LuaValue::from(s.as_str())),
            Expr::Name(name, line) => {
                if let Some(slot) = self.fs.slot_of(name) {
                    Operand::Register(slot)
                } else if let Some(idx) = self.resolve_upvalue(name, *line)? {
                    Operand::Upvalue(idx)
                } else {
                    self.fs.add_constant(LuaValue::from(name.as_str()));
                    Operand::Global
                }
            }
            _ => Operand::Temp,
        };
        Ok(op)
    }

    fn constant_operand(&mut self, value: LuaValue) -> Operand {
        let idx = self.fs.add_constant(value);
        if idx <= MAXINDEXRK {
            Operand::Constant(rk_const(idx))
        } else {
            Operand::Temp
        }
    }
}
