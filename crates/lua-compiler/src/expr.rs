//! Expression compilation.
//!
//! Every expression is compiled into a target register `a` with a wanted
//! value count `n`: `1` for exactly one value, `0` for calls whose results
//! are dropped (and relational operators used as conditions), `-1` for
//! "all values" (open calls and `...`).

use crate::compiler::Compiler;
use crate::operand::Operand;
use lua_ast::{BinOp, Expr, Field, UnOp};
use lua_core::opcode::{rk_const, LFIELDS_PER_FLUSH, MAXINDEXRK};
use lua_core::{LuaError, LuaValue, OpCode};

impl Compiler {
    pub(crate) fn compile_expr(&mut self, expr: &Expr, a: u8, n: i32) -> Result<(), LuaError> {
        let line = expr.line();
        match expr {
            Expr::Nil(_) => self.fs.emit_load_nil(a, 1, line),
            Expr::True(_) => self.fs.emit_load_bool(a, true, false, line),
            Expr::False(_) => self.fs.emit_load_bool(a, false, false, line),
            Expr::Integer(v, _) => self.fs.emit_load_k(a, LuaValue::Integer(*v), line),
            Expr::Float(v, _) => self.fs.emit_load_k(a, LuaValue::Float(*v), line),
            Expr::LuaString(s, _) => self.fs.emit_load_k(a, LuaValue::from(s.as_str()), line),
            Expr::Vararg(_) => {
                if !self.fs.is_vararg {
                    return Err(LuaError::compile(
                        line,
                        "cannot use '...' outside a vararg function",
                    ));
                }
                self.fs.emit_vararg(a, n, line);
            }
            Expr::Name(name, _) => self.compile_name(name, a, line)?,
            Expr::Paren(inner, _) => self.compile_expr(inner, a, 1)?,
            Expr::BinOp { op, lhs, rhs, .. } => self.compile_binop(*op, lhs, rhs, a, n, line)?,
            Expr::UnOp { op, operand, .. } => {
                let b = self.fs.alloc_reg(line)?;
                self.compile_expr(operand, b, 1)?;
                self.fs.free_reg();
                let code = match op {
                    UnOp::Neg => OpCode::Unm,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                    UnOp::BitNot => OpCode::BNot,
                };
                self.fs.emit_abc(code, a as u32, b as u32, 0, line);
            }
            Expr::Index { table, key, .. } => self.compile_index(table, key, a, line)?,
            Expr::Field { table, field, .. } => {
                let key = Expr::LuaString(field.clone(), line);
                self.compile_index(table, &key, a, line)?;
            }
            Expr::FnCall { .. } | Expr::MethodCall { .. } => self.compile_call(expr, a, n, false)?,
            Expr::FnDef(body) => self.compile_function(body, a, false)?,
            Expr::Table(fields, _) => self.compile_table(fields, a, line)?,
        }
        Ok(())
    }

    // ── Names & indexing ──────────────────────────────────────────────────────

    fn compile_name(&mut self, name: &str, a: u8, line: u32) -> Result<(), LuaError> {
        if let Some(slot) = self.fs.slot_of(name) {
            self.fs.emit_move(a, slot, line);
        } else if let Some(idx) = self.resolve_upvalue(name, line)? {
            self.fs.emit_abc(OpCode::GetUpval, a as u32, idx as u32, 0, line);
        } else if name == "_ENV" {
            return Err(LuaError::Internal("_ENV is not in scope".into()));
        } else {
            let env = Expr::Name("_ENV".to_owned(), line);
            let key = Expr::LuaString(name.to_owned(), line);
            self.compile_index(&env, &key, a, line)?;
        }
        Ok(())
    }

    /// `R(a) := table[key]`, reading the table straight from its local or
    /// upvalue and the key from its register or constant slot when possible.
    fn compile_index(&mut self, table: &Expr, key: &Expr, a: u8, line: u32) -> Result<(), LuaError> {
        let t = self.classify(table)?;
        let (tab, table_in_a) = match t {
            Operand::Register(r) | Operand::Upvalue(r) => (r as u32, false),
            _ => {
                self.compile_expr(table, a, 1)?;
                (a as u32, true)
            }
        };
        let rk = match self.classify(key)?.rk() {
            Some(rk) => rk,
            None if table_in_a => {
                let tmp = self.fs.alloc_reg(line)?;
                self.compile_expr(key, tmp, 1)?;
                self.fs.free_reg();
                tmp as u32
            }
            None => {
                self.compile_expr(key, a, 1)?;
                a as u32
            }
        };
        let op = match t {
            Operand::Upvalue(_) => OpCode::GetTabUp,
            _ => OpCode::GetTable,
        };
        self.fs.emit_abc(op, a as u32, tab, rk, line);
        Ok(())
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    /// Compile a call into `a`, which must be the top register. With `tail`
    /// set, emits `TAILCALL` instead of `CALL` and ignores `n`.
    pub(crate) fn compile_call(
        &mut self,
        expr: &Expr,
        a: u8,
        n: i32,
        tail: bool,
    ) -> Result<(), LuaError> {
        if !self.fs.is_top(a) {
            return Err(LuaError::Internal(format!(
                "call target r{a} is not the top register"
            )));
        }
        let (args, line, mut n_args) = match expr {
            Expr::FnCall { func, args, line } => {
                self.compile_expr(func, a, 1)?;
                (args, *line, 0)
            }
            Expr::MethodCall {
                obj,
                method,
                args,
                line,
            } => {
                let obj_reg = match self.classify(obj)? {
                    Operand::Register(r) => r,
                    _ => {
                        self.compile_expr(obj, a, 1)?;
                        a
                    }
                };
                let self_reg = self.fs.alloc_reg(*line)?;
                let idx = self.fs.add_constant(LuaValue::from(method.as_str()));
                if idx <= MAXINDEXRK {
                    self.fs
                        .emit_abc(OpCode::SelfOp, a as u32, obj_reg as u32, rk_const(idx), *line);
                } else {
                    // SELF writes R(a+1) before reading RK(C); keep the key above it.
                    let k = self.fs.alloc_reg(*line)?;
                    self.fs.emit_load_k(k, LuaValue::from(method.as_str()), *line);
                    self.fs
                        .emit_abc(OpCode::SelfOp, a as u32, obj_reg as u32, k as u32, *line);
                    self.fs.free_reg();
                }
                debug_assert_eq!(self_reg, a + 1);
                (args, *line, 1)
            }
            _ => return Err(LuaError::Internal("not a call expression".into())),
        };

        let mut open = false;
        for (i, arg) in args.iter().enumerate() {
            let tmp = self.fs.alloc_reg(line)?;
            if i == args.len() - 1 && arg.is_multi_valued() {
                open = true;
                self.compile_expr(arg, tmp, -1)?;
            } else {
                self.compile_expr(arg, tmp, 1)?;
            }
        }
        n_args += args.len();
        self.fs.free_regs(n_args);

        let b = if open { -1 } else { n_args as i32 };
        if tail {
            self.fs.emit_tail_call(a, b, line);
        } else {
            self.fs.emit_call(a, b, n, line);
        }
        Ok(())
    }

    // ── Operators ─────────────────────────────────────────────────────────────

    fn compile_binop(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        a: u8,
        n: i32,
        line: u32,
    ) -> Result<(), LuaError> {
        match op {
            BinOp::And | BinOp::Or => self.compile_logical(op, lhs, rhs, a, line),
            BinOp::Concat => self.compile_concat(lhs, rhs, a, line),
            BinOp::Pow => self.compile_pow(lhs, rhs, a, line),
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
                self.compile_compare(op, lhs, rhs, a, n == 0, line)
            }
            _ => {
                let (b, c) = self.binop_operands(lhs, rhs, a, line)?;
                self.fs.emit_abc(arith_opcode(op), a as u32, b, c, line);
                Ok(())
            }
        }
    }

    /// RK operands for a two-operand instruction targeting `a`. Operands that
    /// are neither registers nor constants are evaluated: the left one into
    /// `a`, the right one into `a` or a temporary if `a` is taken.
    fn binop_operands(
        &mut self,
        lhs: &Expr,
        rhs: &Expr,
        a: u8,
        line: u32,
    ) -> Result<(u32, u32), LuaError> {
        let (b, lhs_in_a) = match self.classify(lhs)?.rk() {
            Some(rk) => (rk, false),
            None => {
                self.compile_expr(lhs, a, 1)?;
                (a as u32, true)
            }
        };
        let c = match self.classify(rhs)?.rk() {
            Some(rk) => rk,
            None if lhs_in_a => {
                let tmp = self.fs.alloc_reg(line)?;
                self.compile_expr(rhs, tmp, 1)?;
                self.fs.free_reg();
                tmp as u32
            }
            None => {
                self.compile_expr(rhs, a, 1)?;
                a as u32
            }
        };
        Ok((b, c))
    }

    /// Relational operators. As a condition, emit the test followed by a
    /// placeholder jump taken when the comparison fails; otherwise
    /// materialize a boolean into `a`.
    fn compile_compare(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        a: u8,
        cond: bool,
        line: u32,
    ) -> Result<(), LuaError> {
        let (b, c) = self.binop_operands(lhs, rhs, a, line)?;
        let (code, b, c) = match op {
            BinOp::Eq | BinOp::NotEq => (OpCode::Eq, b, c),
            BinOp::Lt => (OpCode::Lt, b, c),
            BinOp::LtEq => (OpCode::Le, b, c),
            BinOp::Gt => (OpCode::Lt, c, b),
            _ => (OpCode::Le, c, b),
        };
        let negate = op == BinOp::NotEq;
        if cond {
            self.fs.emit_abc(code, negate as u32, b, c, line);
            self.fs.emit_jump(OpCode::Jmp, 0, line);
        } else {
            self.fs.emit_abc(code, !negate as u32, b, c, line);
            self.fs.emit_asbx(OpCode::Jmp, 0, 1, line);
            self.fs.emit_load_bool(a, false, true, line);
            self.fs.emit_load_bool(a, true, false, line);
        }
        Ok(())
    }

    /// `and` / `or`: the right operand is skipped when the left one decides.
    fn compile_logical(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        a: u8,
        line: u32,
    ) -> Result<(), LuaError> {
        let c = (op == BinOp::Or) as u32;
        match self.classify(lhs)? {
            Operand::Register(r) => {
                self.fs.emit_abc(OpCode::TestSet, a as u32, r as u32, c, line);
            }
            _ => {
                self.compile_expr(lhs, a, 1)?;
                self.fs.emit_test(a, c, line);
            }
        }
        let jmp = self.fs.emit_jump(OpCode::Jmp, 0, line);
        self.compile_expr(rhs, a, 1)?;
        self.fs.patch_jump(jmp, self.fs.pc())
    }

    /// `a .. b .. c` compiles to a single `CONCAT` over consecutive registers.
    fn compile_concat(&mut self, lhs: &Expr, rhs: &Expr, a: u8, line: u32) -> Result<(), LuaError> {
        if !self.fs.is_top(a) {
            return Err(LuaError::Internal(format!(
                "concat target r{a} is not the top register"
            )));
        }
        let parts = flatten_chain(BinOp::Concat, lhs, rhs);
        self.compile_expr(parts[0], a, 1)?;
        for part in &parts[1..] {
            let tmp = self.fs.alloc_reg(line)?;
            self.compile_expr(part, tmp, 1)?;
        }
        let extra = parts.len() - 1;
        self.fs.free_regs(extra);
        self.fs
            .emit_abc(OpCode::Concat, a as u32, a as u32, (a as usize + extra) as u32, line);
        Ok(())
    }

    /// Right-associative `^` chain, folded right to left. A step never
    /// overwrites `a` while `a` still holds an operand a later step reads.
    fn compile_pow(&mut self, lhs: &Expr, rhs: &Expr, a: u8, line: u32) -> Result<(), LuaError> {
        let parts = flatten_chain(BinOp::Pow, lhs, rhs);
        let mut operands = Vec::with_capacity(parts.len());
        let mut in_a: Option<usize> = None;
        let mut temps = 0;
        for (i, part) in parts.iter().enumerate() {
            let rk = match self.classify(part)?.rk() {
                Some(rk) => rk,
                None if in_a.is_none() => {
                    in_a = Some(i);
                    self.compile_expr(part, a, 1)?;
                    a as u32
                }
                None => {
                    let tmp = self.fs.alloc_reg(line)?;
                    temps += 1;
                    self.compile_expr(part, tmp, 1)?;
                    tmp as u32
                }
            };
            operands.push(rk);
        }

        let mut scratch: Option<u8> = None;
        let mut acc = operands[operands.len() - 1];
        for i in (0..operands.len() - 1).rev() {
            let dest = if i > 0 && in_a.is_some_and(|j| j < i) {
                match scratch {
                    Some(s) => s,
                    None => {
                        let s = self.fs.alloc_reg(line)?;
                        scratch = Some(s);
                        s
                    }
                }
            } else {
                a
            };
            self.fs.emit_abc(OpCode::Pow, dest as u32, operands[i], acc, line);
            acc = dest as u32;
        }
        self.fs.free_regs(temps + scratch.is_some() as usize);
        Ok(())
    }

    // ── Table constructor ─────────────────────────────────────────────────────

    fn compile_table(&mut self, fields: &[Field], a: u8, line: u32) -> Result<(), LuaError> {
        if !self.fs.is_top(a) {
            return Err(LuaError::Internal(format!(
                "table target r{a} is not the top register"
            )));
        }
        let n_arr = fields
            .iter()
            .filter(|f| matches!(f, Field::Positional(_)))
            .count();
        self.fs.emit_new_table(a, n_arr, fields.len() - n_arr, line);

        let mut arr_idx = 0;
        let mut pending = 0;
        for (i, field) in fields.iter().enumerate() {
            match field {
                Field::Positional(value) => {
                    arr_idx += 1;
                    pending += 1;
                    let tmp = self.fs.alloc_reg(line)?;
                    let open = i == fields.len() - 1 && value.is_multi_valued();
                    self.compile_expr(value, tmp, if open { -1 } else { 1 })?;
                    if arr_idx % LFIELDS_PER_FLUSH == 0 || arr_idx == n_arr {
                        self.fs.free_regs(pending);
                        let batch = (arr_idx - 1) / LFIELDS_PER_FLUSH + 1;
                        self.fs
                            .emit_set_list(a, if open { 0 } else { pending }, batch, line);
                        pending = 0;
                    }
                }
                Field::Named(name, value) => {
                    let key = Expr::LuaString(name.clone(), line);
                    self.compile_table_entry(a, &key, value, line)?;
                }
                Field::Index(key, value) => self.compile_table_entry(a, key, value, line)?,
            }
        }
        Ok(())
    }

    fn compile_table_entry(
        &mut self,
        a: u8,
        key: &Expr,
        value: &Expr,
        line: u32,
    ) -> Result<(), LuaError> {
        let mut temps = 0;
        let b = self.rk_or_temp(key, &mut temps, line)?;
        let c = self.rk_or_temp(value, &mut temps, line)?;
        self.fs.free_regs(temps);
        self.fs.emit_abc(OpCode::SetTable, a as u32, b, c, line);
        Ok(())
    }

    /// RK operand for `expr`, evaluating it into a fresh temporary when needed.
    fn rk_or_temp(&mut self, expr: &Expr, temps: &mut usize, line: u32) -> Result<u32, LuaError> {
        if let Some(rk) = self.classify(expr)?.rk() {
            return Ok(rk);
        }
        let tmp = self.fs.alloc_reg(line)?;
        *temps += 1;
        self.compile_expr(expr, tmp, 1)?;
        Ok(tmp as u32)
    }
}

/// Operands of a chain of the same right-associative operator, left to right.
fn flatten_chain<'e>(op: BinOp, lhs: &'e Expr, rhs: &'e Expr) -> Vec<&'e Expr> {
    let mut parts = vec![lhs];
    let mut cur = rhs;
    while let Expr::BinOp {
        op: inner,
        lhs,
        rhs,
        ..
    } = cur
    {
        if *inner != op {
            break;
        }
        parts.push(lhs);
        cur = rhs;
    }
    parts.push(cur);
    parts
}

fn arith_opcode(op: BinOp) -> OpCode {
    match op {
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Div => OpCode::Div,
        BinOp::IDiv => OpCode::IDiv,
        BinOp::Mod => OpCode::Mod,
        BinOp::Pow => OpCode::Pow,
        BinOp::BitAnd => OpCode::BAnd,
        BinOp::BitOr => OpCode::BOr,
        BinOp::BitXor => OpCode::BXor,
        BinOp::Shl => OpCode::Shl,
        _ => OpCode::Shr,
    }
}

pub(crate) fn is_relational(op: BinOp) -> bool {
    matches!(
        op,
        BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq
    )
}
