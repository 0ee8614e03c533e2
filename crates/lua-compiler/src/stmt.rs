//! Statement compilation.

use crate::compiler::Compiler;
use crate::expr::is_relational;
use crate::operand::Operand;
use lua_ast::{Block, Expr, FuncBody, FuncName, ReturnStmt, Stmt};
use lua_core::opcode::{rk_const, MAXINDEXRK};
use lua_core::{LuaError, LuaValue, OpCode};

/// Resolved left-hand side of an assignment.
#[derive(Debug, Clone)]
enum Target {
    Local(u8),
    Upvalue(u8),
    Global(String),
    /// Table and key already evaluated into registers.
    Indexed { table: u8, key: u8 },
}

impl Compiler {
    pub(crate) fn compile_block(&mut self, block: &Block) -> Result<(), LuaError> {
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        if let Some(ret) = &block.ret {
            self.compile_return(ret)?;
        }
        Ok(())
    }

    /// A block in its own scope, closing captured locals on exit.
    fn compile_scoped_block(&mut self, block: &Block) -> Result<(), LuaError> {
        self.fs.enter_scope(false);
        self.compile_block(block)?;
        self.fs.close_open_upvals(block.line);
        self.fs.exit_scope()
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), LuaError> {
        match stmt {
            Stmt::Local {
                names,
                values,
                line,
            } => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                self.compile_local(&names, values, *line)
            }
            Stmt::Assign {
                targets,
                values,
                line,
            } => self.compile_assign(targets, values, *line),
            Stmt::FnCall(call) => {
                if !matches!(call, Expr::FnCall { .. } | Expr::MethodCall { .. }) {
                    return Err(LuaError::compile(call.line(), "syntax error: expected a call"));
                }
                let tmp = self.fs.alloc_reg(call.line())?;
                self.compile_expr(call, tmp, 0)?;
                self.fs.free_reg();
                Ok(())
            }
            Stmt::Do(body) => self.compile_scoped_block(body),
            Stmt::While { cond, body, line } => self.compile_while(cond, body, *line),
            Stmt::Repeat { body, cond, line } => self.compile_repeat(body, cond, *line),
            Stmt::If {
                cond,
                then,
                elseifs,
                else_,
                ..
            } => self.compile_if(cond, then, elseifs, else_.as_ref()),
            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            } => self.compile_numeric_for(var, start, limit, step.as_ref(), body, *line),
            Stmt::GenericFor {
                vars,
                iterators,
                body,
                line,
            } => self.compile_generic_for(vars, iterators, body, *line),
            Stmt::FnDef { name, body, line } => self.compile_fn_def(name, body, *line),
            Stmt::LocalFn { name, body, line } => {
                let r = self.fs.add_local(name, *line)?;
                self.compile_function(body, r, false)
            }
            Stmt::Break(line) => self.fs.add_break(*line),
            Stmt::Goto { line, .. } | Stmt::Label { line, .. } => {
                Err(LuaError::compile(*line, "goto and labels are not supported"))
            }
        }
    }

    // ── Assignment ────────────────────────────────────────────────────────────

    fn compile_local(&mut self, names: &[&str], values: &[Expr], line: u32) -> Result<(), LuaError> {
        let mark = self.fs.used_regs();
        self.adjust_values(names.len(), values, line)?;
        self.fs.reset_regs(mark);
        for name in names {
            self.fs.add_local(name, line)?;
        }
        Ok(())
    }

    /// Evaluate `values` into `n_vars` consecutive fresh registers: surplus
    /// values are evaluated and dropped, missing ones come from the last
    /// multi-valued expression or are nil-filled.
    fn adjust_values(&mut self, n_vars: usize, values: &[Expr], line: u32) -> Result<(), LuaError> {
        let mut end = values.len();
        while end > n_vars && matches!(values[end - 1], Expr::Nil(_)) {
            end -= 1;
        }
        let values = &values[..end];
        let n_exps = values.len();

        if n_exps >= n_vars {
            for (i, value) in values.iter().enumerate() {
                let a = self.fs.alloc_reg(line)?;
                let drop_all = i >= n_vars && i == n_exps - 1 && value.is_multi_valued();
                self.compile_expr(value, a, if drop_all { 0 } else { 1 })?;
            }
            return Ok(());
        }

        let mut filled = false;
        for (i, value) in values.iter().enumerate() {
            let a = self.fs.alloc_reg(line)?;
            if i == n_exps - 1 && value.is_multi_valued() {
                let n = n_vars - n_exps + 1;
                self.compile_expr(value, a, n as i32)?;
                self.fs.alloc_regs(n - 1, line)?;
                filled = true;
            } else {
                self.compile_expr(value, a, 1)?;
            }
        }
        if !filled {
            let n = n_vars - n_exps;
            let a = self.fs.alloc_regs(n, line)?;
            self.fs.emit_load_nil(a, n, line);
        }
        Ok(())
    }

    fn compile_assign(&mut self, targets: &[Expr], values: &[Expr], line: u32) -> Result<(), LuaError> {
        let mark = self.fs.used_regs();
        let resolved = self.resolve_targets(targets)?;
        let first = self.fs.used_regs();
        self.adjust_values(targets.len(), values, line)?;
        for (i, target) in resolved.into_iter().enumerate() {
            self.store(target, (first + i) as u8, line)?;
        }
        self.fs.reset_regs(mark);
        Ok(())
    }

    fn resolve_targets(&mut self, targets: &[Expr]) -> Result<Vec<Target>, LuaError> {
        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            let line = target.line();
            let t = match target {
                Expr::Name(name, _) => {
                    if let Some(slot) = self.fs.slot_of(name) {
                        Target::Local(slot)
                    } else if let Some(idx) = self.resolve_upvalue(name, line)? {
                        Target::Upvalue(idx)
                    } else {
                        // The name is interned at store time, after the values.
                        Target::Global(name.clone())
                    }
                }
                Expr::Index { table, key, .. } => {
                    let t = self.fs.alloc_reg(line)?;
                    self.compile_expr(table, t, 1)?;
                    let k = self.fs.alloc_reg(line)?;
                    self.compile_expr(key, k, 1)?;
                    Target::Indexed { table: t, key: k }
                }
                Expr::Field { table, field, .. } => {
                    let t = self.fs.alloc_reg(line)?;
                    self.compile_expr(table, t, 1)?;
                    let k = self.fs.alloc_reg(line)?;
                    self.fs.emit_load_k(k, LuaValue::from(field.as_str()), line);
                    Target::Indexed { table: t, key: k }
                }
                _ => return Err(LuaError::compile(line, "syntax error: cannot assign to this expression")),
            };
            resolved.push(t);
        }
        Ok(resolved)
    }

    fn store(&mut self, target: Target, v: u8, line: u32) -> Result<(), LuaError> {
        match target {
            Target::Local(slot) => self.fs.emit_move(slot, v, line),
            Target::Upvalue(idx) => {
                self.fs.emit_abc(OpCode::SetUpval, v as u32, idx as u32, 0, line);
            }
            Target::Indexed { table, key } => {
                self.fs.emit_abc(OpCode::SetTable, table as u32, key as u32, v as u32, line);
            }
            Target::Global(name) => {
                let (op, env) = if let Some(slot) = self.fs.slot_of("_ENV") {
                    (OpCode::SetTable, slot)
                } else if let Some(idx) = self.resolve_upvalue("_ENV", line)? {
                    (OpCode::SetTabUp, idx)
                } else {
                    return Err(LuaError::Internal("_ENV is not in scope".into()));
                };
                self.store_field(op, env, &name, v, line)?;
            }
        }
        Ok(())
    }

    /// `table[name] = R(v)` with a constant key, loading the key into a
    /// temporary when its index does not fit an RK operand.
    fn store_field(&mut self, op: OpCode, table: u8, name: &str, v: u8, line: u32) -> Result<(), LuaError> {
        let idx = self.fs.add_constant(LuaValue::from(name));
        if idx <= MAXINDEXRK {
            self.fs.emit_abc(op, table as u32, rk_const(idx), v as u32, line);
        } else {
            let k = self.fs.alloc_reg(line)?;
            self.fs.emit_load_k(k, LuaValue::from(name), line);
            self.fs.emit_abc(op, table as u32, k as u32, v as u32, line);
            self.fs.free_reg();
        }
        Ok(())
    }

    /// `function a.b.c:m() end` stores a closure into a name or table field.
    fn compile_fn_def(&mut self, name: &FuncName, body: &FuncBody, line: u32) -> Result<(), LuaError> {
        let mut path: Vec<&String> = name.parts.iter().chain(name.method.iter()).collect();
        let key = path
            .pop()
            .ok_or_else(|| LuaError::compile(line, "syntax error: empty function name"))?;
        let mark = self.fs.used_regs();

        if path.is_empty() {
            let target = Expr::Name(key.clone(), line);
            let resolved = self.resolve_targets(std::slice::from_ref(&target))?;
            let v = self.fs.alloc_reg(line)?;
            self.compile_function(body, v, false)?;
            for t in resolved {
                self.store(t, v, line)?;
            }
        } else {
            let mut prefix = Expr::Name(path[0].clone(), line);
            for part in &path[1..] {
                prefix = Expr::Field {
                    table: Box::new(prefix),
                    field: (*part).clone(),
                    line,
                };
            }
            let t = self.fs.alloc_reg(line)?;
            self.compile_expr(&prefix, t, 1)?;
            let v = self.fs.alloc_reg(line)?;
            self.compile_function(body, v, name.method.is_some())?;
            self.store_field(OpCode::SetTable, t, key, v, line)?;
        }
        self.fs.reset_regs(mark);
        Ok(())
    }

    // ── Return ────────────────────────────────────────────────────────────────

    fn compile_return(&mut self, ret: &ReturnStmt) -> Result<(), LuaError> {
        let line = ret.line;
        let n = ret.values.len();
        if n == 0 {
            self.fs.emit_return(0, 0, line);
            return Ok(());
        }
        if n == 1 {
            match &ret.values[0] {
                Expr::Name(name, _) => {
                    if let Some(slot) = self.fs.slot_of(name) {
                        self.fs.emit_return(slot, 1, line);
                        return Ok(());
                    }
                }
                call @ (Expr::FnCall { .. } | Expr::MethodCall { .. }) => {
                    let a = self.fs.alloc_reg(line)?;
                    self.compile_call(call, a, 0, true)?;
                    self.fs.free_reg();
                    self.fs.emit_return(a, -1, line);
                    return Ok(());
                }
                _ => {}
            }
        }

        let open = ret.values[n - 1].is_multi_valued();
        for (i, value) in ret.values.iter().enumerate() {
            let a = self.fs.alloc_reg(line)?;
            let wanted = if i == n - 1 && open { -1 } else { 1 };
            self.compile_expr(value, a, wanted)?;
        }
        self.fs.free_regs(n);
        let base = self.fs.used_regs() as u8;
        self.fs
            .emit_return(base, if open { -1 } else { n as i32 }, line);
        Ok(())
    }

    // ── Control flow ──────────────────────────────────────────────────────────

    /// Emit the test for `cond` and return the pc of the jump taken when it
    /// is false. The jump is left for the caller to patch.
    pub(crate) fn compile_branch(&mut self, cond: &Expr) -> Result<usize, LuaError> {
        let line = cond.line();
        if let Expr::BinOp { op, .. } = cond {
            if is_relational(*op) {
                let tmp = self.fs.alloc_reg(line)?;
                self.compile_expr(cond, tmp, 0)?;
                self.fs.free_reg();
                return Ok(self.fs.pc() - 1);
            }
        }
        let reg = match self.classify(cond)? {
            Operand::Register(r) => r,
            _ => {
                let tmp = self.fs.alloc_reg(line)?;
                self.compile_expr(cond, tmp, 1)?;
                self.fs.free_reg();
                tmp
            }
        };
        self.fs.emit_test(reg, 0, line);
        Ok(self.fs.emit_jump(OpCode::Jmp, 0, line))
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        then: &Block,
        elseifs: &[(Expr, Block)],
        else_: Option<&Block>,
    ) -> Result<(), LuaError> {
        let clauses: Vec<(&Expr, &Block)> = std::iter::once((cond, then))
            .chain(elseifs.iter().map(|(c, b)| (c, b)))
            .collect();
        let mut exits = Vec::new();
        for (i, (cond, body)) in clauses.iter().enumerate() {
            let skip = self.compile_branch(cond)?;
            self.compile_scoped_block(body)?;
            if i < clauses.len() - 1 || else_.is_some() {
                exits.push(self.fs.emit_jump(OpCode::Jmp, 0, body.line));
            }
            self.fs.patch_jump(skip, self.fs.pc())?;
        }
        if let Some(body) = else_ {
            self.compile_scoped_block(body)?;
        }
        let end = self.fs.pc();
        for pc in exits {
            self.fs.patch_jump(pc, end)?;
        }
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &Block, line: u32) -> Result<(), LuaError> {
        let start = self.fs.pc();
        let exit = if is_always_true(cond) {
            None
        } else {
            Some(self.compile_branch(cond)?)
        };
        self.fs.enter_scope(true);
        self.compile_block(body)?;
        self.fs.close_open_upvals(line);
        let back = self.fs.emit_jump(OpCode::Jmp, 0, line);
        self.fs.patch_jump(back, start)?;
        self.fs.exit_scope()?;
        if let Some(pc) = exit {
            self.fs.patch_jump(pc, self.fs.pc())?;
        }
        Ok(())
    }

    /// The condition is compiled inside the body's scope so it can see the
    /// body's locals.
    fn compile_repeat(&mut self, body: &Block, cond: &Expr, line: u32) -> Result<(), LuaError> {
        let nil_as_false;
        let cond = match cond {
            Expr::Nil(l) => {
                nil_as_false = Expr::False(*l);
                &nil_as_false
            }
            c => c,
        };
        self.fs.enter_scope(true);
        let start = self.fs.pc();
        self.compile_block(body)?;
        if !is_always_true(cond) {
            let back = self.compile_branch(cond)?;
            let a = self.fs.jmp_arg_a();
            self.fs.set_jump_a(back, a);
            self.fs.patch_jump(back, start)?;
        }
        self.fs.close_open_upvals(line);
        self.fs.exit_scope()
    }

    fn compile_numeric_for(
        &mut self,
        var: &str,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: u32,
    ) -> Result<(), LuaError> {
        self.fs.enter_scope(true);
        let default_step = Expr::Integer(1, line);
        let control = [start.clone(), limit.clone(), step.unwrap_or(&default_step).clone()];
        self.compile_local(&["(for index)", "(for limit)", "(for step)"], &control, line)?;
        let base = self.fs.used_regs() as u8 - 3;
        self.fs.add_local(var, line)?;

        let prep = self.fs.emit_jump(OpCode::ForPrep, base as u32, line);
        self.compile_block(body)?;
        self.fs.close_open_upvals(line);
        let lp = self.fs.emit_jump(OpCode::ForLoop, base as u32, line);
        self.fs.patch_jump(prep, lp)?;
        self.fs.patch_jump(lp, prep + 1)?;
        self.fs.exit_scope()
    }

    fn compile_generic_for(
        &mut self,
        vars: &[String],
        iterators: &[Expr],
        body: &Block,
        line: u32,
    ) -> Result<(), LuaError> {
        self.fs.enter_scope(true);
        self.compile_local(&["(for generator)", "(for state)", "(for control)"], iterators, line)?;
        let base = self.fs.used_regs() as u8 - 3;
        for var in vars {
            self.fs.add_local(var, line)?;
        }

        let to_call = self.fs.emit_jump(OpCode::Jmp, 0, line);
        self.compile_block(body)?;
        self.fs.close_open_upvals(line);
        self.fs.patch_jump(to_call, self.fs.pc())?;
        self.fs
            .emit_abc(OpCode::TForCall, base as u32, 0, vars.len() as u32, line);
        let lp = self.fs.emit_jump(OpCode::TForLoop, base as u32 + 2, line);
        self.fs.patch_jump(lp, to_call + 1)?;
        self.fs.exit_scope()
    }
}

/// Conditions known to be truthy at compile time.
fn is_always_true(e: &Expr) -> bool {
    matches!(
        e,
        Expr::True(_)
            | Expr::Integer(..)
            | Expr::Float(..)
            | Expr::LuaString(..)
            | Expr::Table(..)
            | Expr::FnDef(_)
    )
}
