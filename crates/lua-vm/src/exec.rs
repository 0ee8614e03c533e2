//! The instruction loop for Lua frames.

use crate::arith;
use crate::state::LuaState;
use lua_core::opcode::{fb2int, index_k, is_k, LFIELDS_PER_FLUSH};
use lua_core::{
    Closure, Instruction, LuaClosure, LuaError, LuaTable, LuaValue, OpCode, Proto, UpvalueDesc,
    UpvalueInner,
};
use std::sync::Arc;
use tracing::trace;

impl LuaState {
    /// Execute the current frame until it returns, yielding its results.
    /// A tail call swaps in the callee's frame and keeps going.
    pub(crate) fn run(&mut self) -> Result<Vec<LuaValue>, LuaError> {
        loop {
            let closure = self
                .stack
                .closure
                .clone()
                .ok_or_else(|| LuaError::Internal("no function in the current frame".into()))?;
            let Closure::Lua(lc) = &*closure else {
                return Err(LuaError::Internal("native function in a Lua frame".into()));
            };
            match self.execute_frame(lc)? {
                FrameExit::Return(values) => return Ok(values),
                FrameExit::TailCall => continue,
            }
        }
    }

    fn execute_frame(&mut self, lc: &LuaClosure) -> Result<FrameExit, LuaError> {
        let proto = &*lc.proto;
        let n_regs = proto.max_stack_size as usize;
        loop {
            let inst = self.fetch(proto)?;
            let a = inst.a() as usize;
            match inst.opcode() {
                OpCode::Move => {
                    let v = self.stack.reg(inst.b() as usize);
                    self.stack.set_reg(a, v);
                }
                OpCode::LoadK => self.stack.set_reg(a, constant(proto, inst.bx())?),
                OpCode::LoadKx => {
                    let extra = self.fetch(proto)?;
                    self.stack.set_reg(a, constant(proto, extra.ax_arg())?);
                }
                OpCode::LoadBool => {
                    self.stack.set_reg(a, LuaValue::Boolean(inst.b() != 0));
                    if inst.c() != 0 {
                        self.stack.pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    for r in a..=a + inst.b() as usize {
                        self.stack.set_reg(r, LuaValue::Nil);
                    }
                }
                OpCode::GetUpval => {
                    let v = self.get_upval(lc, inst.b() as usize);
                    self.stack.set_reg(a, v);
                }
                OpCode::SetUpval => {
                    let v = self.stack.reg(a);
                    self.set_upval(lc, inst.b() as usize, v);
                }
                OpCode::GetTabUp => {
                    let t = self.get_upval(lc, inst.b() as usize);
                    let k = self.rk(proto, inst.c())?;
                    let v = self.index(&t, &k)?;
                    self.stack.set_reg(a, v);
                }
                OpCode::GetTable => {
                    let t = self.stack.reg(inst.b() as usize);
                    let k = self.rk(proto, inst.c())?;
                    let v = self.index(&t, &k)?;
                    self.stack.set_reg(a, v);
                }
                OpCode::SetTabUp => {
                    let t = self.get_upval(lc, a);
                    let k = self.rk(proto, inst.b())?;
                    let v = self.rk(proto, inst.c())?;
                    self.set_index(&t, k, v)?;
                }
                OpCode::SetTable => {
                    let t = self.stack.reg(a);
                    let k = self.rk(proto, inst.b())?;
                    let v = self.rk(proto, inst.c())?;
                    self.set_index(&t, k, v)?;
                }
                OpCode::NewTable => {
                    let t = LuaTable::with_capacity(
                        fb2int(inst.b()) as usize,
                        fb2int(inst.c()) as usize,
                    );
                    self.stack.set_reg(a, LuaValue::Table(t.into_ref()));
                }
                OpCode::SelfOp => {
                    let obj = self.stack.reg(inst.b() as usize);
                    let k = self.rk(proto, inst.c())?;
                    self.stack.set_reg(a + 1, obj.clone());
                    let method = self.index(&obj, &k)?;
                    self.stack.set_reg(a, method);
                }
                op @ (OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Mod
                | OpCode::Pow
                | OpCode::Div
                | OpCode::IDiv
                | OpCode::BAnd
                | OpCode::BOr
                | OpCode::BXor
                | OpCode::Shl
                | OpCode::Shr) => {
                    let x = self.rk(proto, inst.b())?;
                    let y = self.rk(proto, inst.c())?;
                    let v = self.arith(op, &x, &y)?;
                    self.stack.set_reg(a, v);
                }
                op @ (OpCode::Unm | OpCode::BNot) => {
                    let x = self.stack.reg(inst.b() as usize);
                    let v = self.arith(op, &x, &x)?;
                    self.stack.set_reg(a, v);
                }
                OpCode::Not => {
                    let x = self.stack.reg(inst.b() as usize);
                    self.stack.set_reg(a, LuaValue::Boolean(!x.is_truthy()));
                }
                OpCode::Len => {
                    let x = self.stack.reg(inst.b() as usize);
                    let v = self.len(&x)?;
                    self.stack.set_reg(a, v);
                }
                OpCode::Concat => {
                    let values = (inst.b()..=inst.c())
                        .map(|r| self.stack.reg(r as usize))
                        .collect();
                    let v = self.concat(values)?;
                    self.stack.set_reg(a, v);
                }
                OpCode::Jmp => {
                    self.jump(inst.sbx());
                    if a != 0 {
                        self.stack.close_upvals(a - 1);
                    }
                }
                op @ (OpCode::Eq | OpCode::Lt | OpCode::Le) => {
                    let x = self.rk(proto, inst.b())?;
                    let y = self.rk(proto, inst.c())?;
                    let holds = match op {
                        OpCode::Eq => self.equals(&x, &y)?,
                        OpCode::Lt => self.less_than(&x, &y)?,
                        _ => self.less_equal(&x, &y)?,
                    };
                    if holds != (a != 0) {
                        self.stack.pc += 1;
                    }
                }
                OpCode::Test => {
                    if self.stack.reg(a).is_truthy() != (inst.c() != 0) {
                        self.stack.pc += 1;
                    }
                }
                OpCode::TestSet => {
                    let v = self.stack.reg(inst.b() as usize);
                    if v.is_truthy() == (inst.c() != 0) {
                        self.stack.set_reg(a, v);
                    } else {
                        self.stack.pc += 1;
                    }
                }
                OpCode::Call => {
                    let n_args = self.call_args(a, inst.b());
                    self.call_value(n_args, inst.c() as i32 - 1)?;
                    if inst.c() != 0 {
                        self.stack.reset_top(n_regs);
                    }
                }
                OpCode::TailCall => {
                    let n_args = self.call_args(a, inst.b());
                    let (callee, n_args) = self.resolve_callee(a, n_args)?;
                    if let Closure::Lua(_) = &*callee {
                        trace!(depth = self.depth(), n_args, "tail call");
                        let frame = self.enter_lua(callee, n_args)?;
                        self.stack.close_upvals(0);
                        self.stack = frame;
                        return Ok(FrameExit::TailCall);
                    }
                    // The RETURN a,0 that follows hands back the native results.
                    self.call_value(n_args, -1)?;
                }
                OpCode::Return => {
                    let values = match inst.b() {
                        0 => self.stack.values_from(a),
                        b => (a..a + b as usize - 1).map(|r| self.stack.reg(r)).collect(),
                    };
                    return Ok(FrameExit::Return(values));
                }
                OpCode::ForPrep => {
                    self.for_prep(a)?;
                    self.jump(inst.sbx());
                }
                OpCode::ForLoop => {
                    if self.for_loop(a) {
                        self.jump(inst.sbx());
                    }
                }
                OpCode::TForCall => {
                    self.stack.reset_top(a + 3);
                    for r in a..a + 3 {
                        let v = self.stack.reg(r);
                        self.stack.push(v);
                    }
                    self.call_value(2, inst.c() as i32)?;
                    self.stack.reset_top(n_regs);
                }
                OpCode::TForLoop => {
                    let control = self.stack.reg(a + 1);
                    if !control.is_nil() {
                        self.stack.set_reg(a, control);
                        self.jump(inst.sbx());
                    }
                }
                OpCode::SetList => {
                    let n = match inst.b() {
                        0 => self.stack.top().saturating_sub(a + 1),
                        b => b as usize,
                    };
                    let batch = match inst.c() {
                        0 => self.fetch(proto)?.ax_arg(),
                        c => c,
                    };
                    self.set_list(a, n, batch as usize)?;
                    if inst.b() == 0 {
                        self.stack.reset_top(n_regs);
                    }
                }
                OpCode::Closure => {
                    let sub = proto
                        .protos
                        .get(inst.bx() as usize)
                        .cloned()
                        .ok_or_else(|| LuaError::Internal("prototype index out of range".into()))?;
                    let closure = self.new_closure(lc, sub);
                    self.stack.set_reg(a, LuaValue::Function(closure));
                }
                OpCode::VarArg => {
                    let varargs = self.stack.varargs.clone();
                    match inst.b() {
                        0 => {
                            self.stack.reset_top(a);
                            for v in varargs {
                                self.stack.push(v);
                            }
                        }
                        b => {
                            let mut it = varargs.into_iter();
                            for r in a..a + b as usize - 1 {
                                self.stack.set_reg(r, it.next().unwrap_or_default());
                            }
                        }
                    }
                }
                OpCode::ExtraArg => {
                    return Err(LuaError::Internal("EXTRAARG executed on its own".into()));
                }
            }
        }
    }

    // ── Operand access ───────────────────────────────────────────────────────

    fn fetch(&mut self, proto: &Proto) -> Result<Instruction, LuaError> {
        let pc = self.stack.pc;
        let inst = *proto
            .code
            .get(pc)
            .ok_or_else(|| LuaError::Internal(format!("pc {pc} outside the function")))?;
        self.stack.pc += 1;
        Ok(inst)
    }

    fn jump(&mut self, sbx: i32) {
        self.stack.pc = (self.stack.pc as i64 + sbx as i64) as usize;
    }

    fn rk(&self, proto: &Proto, x: u32) -> Result<LuaValue, LuaError> {
        if is_k(x) {
            constant(proto, index_k(x))
        } else {
            Ok(self.stack.reg(x as usize))
        }
    }

    fn get_upval(&self, lc: &LuaClosure, idx: usize) -> LuaValue {
        let Some(cell) = lc.upvalues.get(idx) else {
            return LuaValue::Nil;
        };
        let inner = cell.0.read().clone();
        match inner {
            UpvalueInner::Open { frame, slot } => {
                self.frame(frame).map(|f| f.reg(slot)).unwrap_or_default()
            }
            UpvalueInner::Closed(v) => v,
        }
    }

    fn set_upval(&mut self, lc: &LuaClosure, idx: usize, value: LuaValue) {
        let Some(cell) = lc.upvalues.get(idx) else {
            return;
        };
        let inner = cell.0.read().clone();
        match inner {
            UpvalueInner::Open { frame, slot } => {
                if let Some(f) = self.frame_mut(frame) {
                    f.set_reg(slot, value);
                }
            }
            UpvalueInner::Closed(_) => *cell.0.write() = UpvalueInner::Closed(value),
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    /// Arrange the callee at `a` and its arguments at the top of the frame,
    /// returning the argument count. `b == 0` means the arguments run up to
    /// the current top.
    fn call_args(&mut self, a: usize, b: u32) -> usize {
        if b != 0 {
            self.stack.set_top(a + b as usize);
        }
        self.stack.top().saturating_sub(a + 1)
    }

    fn new_closure(&mut self, parent: &LuaClosure, proto: Arc<Proto>) -> Arc<Closure> {
        let frame = self.frame_index();
        let upvals = proto
            .upvalues
            .iter()
            .map(|desc| match *desc {
                UpvalueDesc::Stack(slot) => self.stack.open_upvalue(frame, slot as usize),
                UpvalueDesc::Upvalue(idx) => parent
                    .upvalues
                    .get(idx as usize)
                    .cloned()
                    .unwrap_or_else(|| lua_core::Upvalue::closed(LuaValue::Nil)),
            })
            .collect();
        Arc::new(Closure::lua(proto, upvals))
    }

    // ── Loops and tables ─────────────────────────────────────────────────────

    /// Check the loop operands at `a..a+3`, choose integer or float stepping
    /// and pre-decrement the index. An integer loop keeps its remaining
    /// iteration count in place of the limit, so stepping never overflows.
    fn for_prep(&mut self, a: usize) -> Result<(), LuaError> {
        let init = self.stack.reg(a);
        let limit = self.stack.reg(a + 1);
        let step = self.stack.reg(a + 2);
        let init = arith::to_number(&init).ok_or_else(|| for_error("initial"))?;
        let limit = arith::to_number(&limit).ok_or_else(|| for_error("limit"))?;
        let step = arith::to_number(&step).ok_or_else(|| for_error("step"))?;

        if let (LuaValue::Integer(i), LuaValue::Integer(s)) = (&init, &step) {
            if *s == 0 {
                return Err(LuaError::Runtime("'for' step is zero".into()));
            }
            let limit = match limit {
                LuaValue::Integer(l) => l,
                LuaValue::Float(f) => clamp_limit(f, *s > 0),
                _ => return Err(for_error("limit")),
            };
            let count = iteration_count(*i, limit, *s);
            self.stack.set_reg(a, LuaValue::Integer(i.wrapping_sub(*s)));
            self.stack.set_reg(a + 1, LuaValue::Integer(count as i64));
            return Ok(());
        }

        let (Some(i), Some(l), Some(s)) = (
            arith::to_float(&init),
            arith::to_float(&limit),
            arith::to_float(&step),
        ) else {
            return Err(for_error("initial"));
        };
        if s == 0.0 {
            return Err(LuaError::Runtime("'for' step is zero".into()));
        }
        self.stack.set_reg(a, LuaValue::Float(i - s));
        self.stack.set_reg(a + 1, LuaValue::Float(l));
        self.stack.set_reg(a + 2, LuaValue::Float(s));
        Ok(())
    }

    /// Step the loop at `a`; true while the index is within the limit.
    fn for_loop(&mut self, a: usize) -> bool {
        let next = match (self.stack.reg(a), self.stack.reg(a + 1), self.stack.reg(a + 2)) {
            (LuaValue::Integer(i), LuaValue::Integer(count), LuaValue::Integer(step)) => {
                let count = count as u64;
                if count == 0 {
                    return false;
                }
                self.stack.set_reg(a + 1, LuaValue::Integer((count - 1) as i64));
                Some(LuaValue::Integer(i.wrapping_add(step)))
            }
            (LuaValue::Float(i), LuaValue::Float(limit), LuaValue::Float(step)) => {
                let n = i + step;
                let go_on = if step > 0.0 { n <= limit } else { limit <= n };
                go_on.then_some(LuaValue::Float(n))
            }
            _ => None,
        };
        match next {
            Some(v) => {
                self.stack.set_reg(a, v.clone());
                self.stack.set_reg(a + 3, v);
                true
            }
            None => false,
        }
    }

    /// Store registers `a+1..=a+n` into the table at `a`, starting at
    /// array index `(batch - 1) * LFIELDS_PER_FLUSH + 1`.
    fn set_list(&mut self, a: usize, n: usize, batch: usize) -> Result<(), LuaError> {
        let LuaValue::Table(t) = self.stack.reg(a) else {
            return Err(LuaError::Internal("SETLIST target is not a table".into()));
        };
        let first = batch.saturating_sub(1) * LFIELDS_PER_FLUSH;
        let mut t = t.write();
        for j in 1..=n {
            t.set(LuaValue::Integer((first + j) as i64), self.stack.reg(a + j))
                .map_err(|msg| LuaError::Runtime(msg.into()))?;
        }
        Ok(())
    }
}

/// How a frame's instruction loop ended.
enum FrameExit {
    Return(Vec<LuaValue>),
    /// The current frame was replaced by a tail-called Lua function.
    TailCall,
}

fn constant(proto: &Proto, idx: u32) -> Result<LuaValue, LuaError> {
    proto
        .constants
        .get(idx as usize)
        .cloned()
        .ok_or_else(|| LuaError::Internal(format!("constant {idx} out of range")))
}

fn for_error(what: &str) -> LuaError {
    LuaError::Runtime(format!("'for' {what} value must be a number"))
}

/// How many times an integer loop from `init` to `limit` by `step` runs.
/// Counted in `u64`, so loops touching the ends of the `i64` range are exact.
fn iteration_count(init: i64, limit: i64, step: i64) -> u64 {
    if step > 0 {
        if init > limit {
            return 0;
        }
        ((limit as u64).wrapping_sub(init as u64) / step as u64).saturating_add(1)
    } else {
        if init < limit {
            return 0;
        }
        // -(step + 1) + 1 avoids negating i64::MIN
        let stride = (-(step + 1)) as u64 + 1;
        ((init as u64).wrapping_sub(limit as u64) / stride).saturating_add(1)
    }
}

/// An integer loop limit for a float `f`, rounded towards the loop's range.
fn clamp_limit(f: f64, ascending: bool) -> i64 {
    let f = if ascending { f.floor() } else { f.ceil() };
    if f.is_nan() {
        return if ascending { i64::MIN } else { i64::MAX };
    }
    if f >= i64::MAX as f64 {
        i64::MAX
    } else if f <= i64::MIN as f64 {
        i64::MIN
    } else {
        f as i64
    }
}

#[cfg(test)]
mod tests {
    use crate::{LuaState, VmConfig};
    use lua_ast::build::*;
    use lua_ast::{BinOp, Block, Expr, Field, UnOp};
    use lua_compiler::compile;
    use lua_core::{LuaError, LuaValue};

    fn run_on(lua: &mut LuaState, b: Block) -> Result<Vec<LuaValue>, LuaError> {
        let chunk = compile(&b, "test").unwrap();
        lua.execute(&chunk)
    }

    fn run(b: Block) -> Vec<LuaValue> {
        run_on(&mut LuaState::new(), b).unwrap()
    }

    fn run_err(b: Block) -> LuaError {
        let mut lua = LuaState::new();
        let err = run_on(&mut lua, b).unwrap_err();
        assert_eq!(lua.depth(), 1);
        err
    }

    fn num(n: i64) -> LuaValue {
        LuaValue::Integer(n)
    }

    fn s(v: &str) -> LuaValue {
        LuaValue::from(v)
    }

    fn add(a: Expr, b: Expr) -> Expr {
        bin(BinOp::Add, a, b)
    }

    fn named(k: &str, v: Expr) -> Field {
        Field::Named(k.to_owned(), v)
    }

    fn lambda(params: &[&str], body: Block) -> Expr {
        func(params, false, body)
    }

    // ── Expressions ───────────────────────────────────────────────────────────

    #[test]
    fn empty_chunk_returns_nothing() {
        assert_eq!(run(block(vec![])), vec![]);
    }

    #[test]
    fn arithmetic() {
        let r = run(block_ret(
            vec![],
            vec![
                add(int(1), bin(BinOp::Mul, int(2), int(3))),
                bin(BinOp::IDiv, int(7), int(2)),
                bin(BinOp::Div, int(7), int(2)),
                bin(BinOp::Pow, int(2), int(10)),
                bin(BinOp::Mod, un(UnOp::Neg, int(7)), int(3)),
            ],
        ));
        assert_eq!(r, vec![num(7), num(3), LuaValue::Float(3.5), LuaValue::Float(1024.0), num(2)]);
        assert!(matches!(r[0], LuaValue::Integer(_)));
        assert!(matches!(r[3], LuaValue::Float(_)));
    }

    #[test]
    fn bitwise_and_concat() {
        let r = run(block_ret(
            vec![],
            vec![
                bin(BinOp::BitOr, int(0xF0), int(0x0F)),
                bin(BinOp::Shl, int(1), int(4)),
                un(UnOp::BitNot, int(0)),
                bin(BinOp::Concat, string("a"), bin(BinOp::Concat, int(1), float(2.0))),
            ],
        ));
        assert_eq!(r, vec![num(255), num(16), num(-1), s("a12.0")]);
    }

    #[test]
    fn comparisons_and_logic() {
        let r = run(block_ret(
            vec![],
            vec![
                bin(BinOp::Lt, int(1), int(2)),
                bin(BinOp::Lt, string("a"), string("b")),
                bin(BinOp::GtEq, int(1), float(1.5)),
                un(UnOp::Not, nil()),
                bin(BinOp::Or, nil(), string("d")),
                bin(BinOp::And, ff(), int(1)),
                bin(BinOp::NotEq, int(1), float(1.0)),
            ],
        ));
        let t = LuaValue::Boolean(true);
        let f = LuaValue::Boolean(false);
        assert_eq!(r, vec![t.clone(), t.clone(), f.clone(), t, s("d"), f.clone(), f]);
    }

    #[test]
    fn globals_persist_across_chunks() {
        let mut lua = LuaState::new();
        run_on(&mut lua, block(vec![assign(vec![name("x")], vec![int(7)])])).unwrap();
        let r = run_on(&mut lua, block_ret(vec![], vec![add(name("x"), int(1))])).unwrap();
        assert_eq!(r, vec![num(8)]);
        assert_eq!(lua.get_global("x"), num(7));
    }

    #[test]
    fn multiple_assignment_swaps() {
        let r = run(block_ret(
            vec![
                local(&["a", "b"], vec![int(1), int(2)]),
                assign(vec![name("a"), name("b")], vec![name("b"), name("a")]),
            ],
            vec![name("a"), name("b")],
        ));
        assert_eq!(r, vec![num(2), num(1)]);
    }

    // ── Control flow ──────────────────────────────────────────────────────────

    #[test]
    fn while_and_repeat() {
        let r = run(block_ret(
            vec![
                local(&["i", "s"], vec![int(0), int(0)]),
                while_(
                    bin(BinOp::Lt, name("i"), int(5)),
                    block(vec![
                        assign(vec![name("i")], vec![add(name("i"), int(1))]),
                        assign(vec![name("s")], vec![add(name("s"), name("i"))]),
                    ]),
                ),
                repeat(
                    block(vec![assign(
                        vec![name("s")],
                        vec![bin(BinOp::Sub, name("s"), int(1))],
                    )]),
                    bin(BinOp::Lt, name("s"), int(10)),
                ),
            ],
            vec![name("s")],
        ));
        assert_eq!(r, vec![num(9)]);
    }

    fn sum_loop(start: Expr, limit: Expr, step: Option<Expr>) -> Block {
        block_ret(
            vec![
                local(&["s"], vec![int(0)]),
                numeric_for(
                    "i",
                    start,
                    limit,
                    step,
                    block(vec![assign(vec![name("s")], vec![add(name("s"), name("i"))])]),
                ),
            ],
            vec![name("s")],
        )
    }

    #[test]
    fn numeric_for_loops() {
        assert_eq!(run(sum_loop(int(1), int(10), None)), vec![num(55)]);
        assert_eq!(run(sum_loop(int(10), int(1), Some(int(-3)))), vec![num(22)]);
        assert_eq!(run(sum_loop(int(1), int(0), None)), vec![num(0)]);
        assert_eq!(
            run(sum_loop(int(1), int(2), Some(float(0.5)))),
            vec![LuaValue::Float(4.5)]
        );
    }

    fn count_loop(start: i64, limit: i64, step: i64) -> Vec<LuaValue> {
        run(block_ret(
            vec![
                local(&["n"], vec![int(0)]),
                numeric_for(
                    "i",
                    int(start),
                    int(limit),
                    Some(int(step)),
                    block(vec![assign(vec![name("n")], vec![add(name("n"), int(1))])]),
                ),
            ],
            vec![name("n")],
        ))
    }

    #[test]
    fn integer_loops_at_the_ends_of_the_range() {
        assert_eq!(count_loop(i64::MIN, i64::MIN + 2, 1), vec![num(3)]);
        assert_eq!(count_loop(i64::MAX, i64::MAX - 1, -1), vec![num(2)]);
        assert_eq!(count_loop(i64::MAX - 2, i64::MAX, 1), vec![num(3)]);
        assert_eq!(count_loop(i64::MIN + 1, i64::MIN, -1), vec![num(2)]);
        assert_eq!(count_loop(0, i64::MAX, i64::MAX), vec![num(2)]);
        assert_eq!(count_loop(0, i64::MIN, i64::MIN), vec![num(2)]);
        assert_eq!(count_loop(i64::MAX, i64::MIN, 1), vec![num(0)]);
    }

    #[test]
    fn integer_loop_visits_the_last_value_before_the_limit() {
        let r = run(block_ret(
            vec![
                local(&["last"], vec![nil()]),
                numeric_for(
                    "i",
                    int(i64::MAX - 5),
                    int(i64::MAX),
                    Some(int(2)),
                    block(vec![assign(vec![name("last")], vec![name("i")])]),
                ),
            ],
            vec![name("last")],
        ));
        assert_eq!(r, vec![num(i64::MAX - 1)]);
    }

    #[test]
    fn for_loop_rejects_non_numbers_and_zero_step() {
        assert!(matches!(
            run_err(sum_loop(string("x"), int(2), None)),
            LuaError::Runtime(_)
        ));
        assert!(matches!(
            run_err(sum_loop(int(1), int(2), Some(int(0)))),
            LuaError::Runtime(_)
        ));
    }

    #[test]
    fn generic_for_with_ipairs_and_pairs() {
        let r = run(block_ret(
            vec![
                local(&["sum", "n"], vec![int(0), int(0)]),
                generic_for(
                    &["_", "v"],
                    vec![call(name("ipairs"), vec![list(vec![int(10), int(20), int(30)])])],
                    block(vec![assign(vec![name("sum")], vec![add(name("sum"), name("v"))])]),
                ),
                generic_for(
                    &["k"],
                    vec![call(
                        name("pairs"),
                        vec![table(vec![
                            named("a", int(1)),
                            named("b", int(2)),
                            Field::Positional(int(3)),
                        ])],
                    )],
                    block(vec![assign(vec![name("n")], vec![add(name("n"), int(1))])]),
                ),
            ],
            vec![name("sum"), name("n")],
        ));
        assert_eq!(r, vec![num(60), num(3)]);
    }

    #[test]
    fn pairs_tolerates_clearing_visited_fields() {
        let r = run(block_ret(
            vec![
                local(
                    &["t"],
                    vec![table(vec![
                        named("a", int(1)),
                        named("b", int(2)),
                        named("c", int(3)),
                        Field::Positional(int(4)),
                        Field::Positional(int(5)),
                    ])],
                ),
                local(&["n"], vec![int(0)]),
                generic_for(
                    &["k"],
                    vec![call(name("pairs"), vec![name("t")])],
                    block(vec![
                        assign(vec![index(name("t"), name("k"))], vec![nil()]),
                        assign(vec![name("n")], vec![add(name("n"), int(1))]),
                    ]),
                ),
            ],
            vec![name("n"), call(name("next"), vec![name("t")]), un(UnOp::Len, name("t"))],
        ));
        assert_eq!(r, vec![num(5), LuaValue::Nil, num(0)]);
    }

    #[test]
    fn break_leaves_the_innermost_loop() {
        let r = run(block_ret(
            vec![
                local(&["n"], vec![int(0)]),
                while_(
                    tt(),
                    block(vec![
                        assign(vec![name("n")], vec![add(name("n"), int(1))]),
                        if_(
                            bin(BinOp::Eq, name("n"), int(4)),
                            block(vec![brk()]),
                            vec![],
                            None,
                        ),
                    ]),
                ),
            ],
            vec![name("n")],
        ));
        assert_eq!(r, vec![num(4)]);
    }

    // ── Tables ────────────────────────────────────────────────────────────────

    #[test]
    fn large_constructor_flushes_in_batches() {
        let items = (1..=60).map(int).collect();
        let r = run(block_ret(
            vec![local(&["t"], vec![list(items)])],
            vec![
                un(UnOp::Len, name("t")),
                index(name("t"), int(55)),
            ],
        ));
        assert_eq!(r, vec![num(60), num(55)]);
    }

    #[test]
    fn constructor_past_the_last_inline_batch() {
        // 513 flushes of 50; batches above 511 travel in EXTRAARG.
        let n = 25_601;
        let items = (1..=n).map(int).collect();
        let r = run(block_ret(
            vec![local(&["t"], vec![list(items)])],
            vec![
                un(UnOp::Len, name("t")),
                index(name("t"), int(25_550)),
                index(name("t"), int(25_551)),
                index(name("t"), int(n)),
            ],
        ));
        assert_eq!(r, vec![num(n), num(25_550), num(25_551), num(n)]);
    }

    #[test]
    fn loadkx_reads_its_index_from_extraarg() {
        use lua_compiler::Chunk;
        use lua_core::{Instruction, OpCode, Proto, UpvalueDesc};

        let proto = Proto {
            code: vec![
                Instruction::abx(OpCode::LoadKx, 0, 0),
                Instruction::ax(OpCode::ExtraArg, 1),
                Instruction::abc(OpCode::Return, 0, 2, 0),
            ],
            line_info: vec![1; 3],
            constants: vec![s("near"), s("far")],
            upvalues: vec![UpvalueDesc::Stack(0)],
            upvalue_names: vec!["_ENV".into()],
            is_vararg: true,
            max_stack_size: 2,
            ..Proto::default()
        };
        let r = LuaState::new().execute(&Chunk::new(proto)).unwrap();
        assert_eq!(r, vec![s("far")]);
    }

    #[test]
    fn constructor_expands_a_trailing_call() {
        let three = lambda(&[], block_ret(vec![], vec![int(1), int(2), int(3)]));
        let r = run(block_ret(
            vec![
                local(&["f"], vec![three]),
                local(&["t"], vec![list(vec![int(0), call(name("f"), vec![])])]),
            ],
            vec![un(UnOp::Len, name("t")), index(name("t"), int(4))],
        ));
        assert_eq!(r, vec![num(4), num(3)]);
    }

    // ── Functions, closures, varargs ──────────────────────────────────────────

    #[test]
    fn closures_share_a_counter() {
        let counter = func_body(
            &[],
            false,
            block_ret(
                vec![local(&["n"], vec![int(0)])],
                vec![lambda(
                    &[],
                    block_ret(
                        vec![assign(vec![name("n")], vec![add(name("n"), int(1))])],
                        vec![name("n")],
                    ),
                )],
            ),
        );
        let r = run(block_ret(
            vec![
                local_fn("counter", counter),
                local(&["c"], vec![call(name("counter"), vec![])]),
                call_stmt(name("c"), vec![]),
                call_stmt(name("c"), vec![]),
            ],
            vec![call(name("c"), vec![])],
        ));
        assert_eq!(r, vec![num(3)]);
    }

    #[test]
    fn loop_closures_capture_a_fresh_variable_each_iteration() {
        let r = run(block_ret(
            vec![
                local(&["fns"], vec![table(vec![])]),
                numeric_for(
                    "i",
                    int(1),
                    int(3),
                    None,
                    block(vec![assign(
                        vec![index(name("fns"), name("i"))],
                        vec![lambda(&[], block_ret(vec![], vec![name("i")]))],
                    )]),
                ),
            ],
            vec![
                call(index(name("fns"), int(1)), vec![]),
                call(index(name("fns"), int(3)), vec![]),
            ],
        ));
        assert_eq!(r, vec![num(1), num(3)]);
    }

    #[test]
    fn varargs_are_counted_and_forwarded() {
        let f = func_body(
            &[],
            true,
            block_ret(
                vec![],
                vec![call(name("select"), vec![string("#"), vararg()]), vararg()],
            ),
        );
        let r = run(block_ret(
            vec![local_fn("f", f)],
            vec![call(name("f"), vec![int(1), nil(), int(3)])],
        ));
        assert_eq!(r, vec![num(3), num(1), LuaValue::Nil, num(3)]);
    }

    #[test]
    fn surplus_arguments_become_varargs() {
        let g = func_body(
            &["a"],
            true,
            block_ret(
                vec![local(&["t"], vec![list(vec![vararg()])])],
                vec![un(UnOp::Len, name("t")), name("a")],
            ),
        );
        let r = run(block_ret(
            vec![local_fn("g", g)],
            vec![call(name("g"), vec![int(1), int(2), int(3)])],
        ));
        assert_eq!(r, vec![num(2), num(1)]);
    }

    #[test]
    fn missing_arguments_are_nil_and_results_adjust() {
        let id = func(&[], true, block_ret(vec![], vec![vararg()]));
        let r = run(block_ret(
            vec![local(&["a", "b", "c"], vec![call(paren(id), vec![int(1), int(2)])])],
            vec![name("a"), name("b"), name("c")],
        ));
        assert_eq!(r, vec![num(1), num(2), LuaValue::Nil]);
    }

    #[test]
    fn tail_recursion_runs_in_constant_depth() {
        let body = func_body(
            &["n"],
            false,
            block_ret(
                vec![if_(
                    bin(BinOp::Eq, name("n"), int(0)),
                    block_ret(vec![], vec![string("done")]),
                    vec![],
                    None,
                )],
                vec![call(name("loop"), vec![bin(BinOp::Sub, name("n"), int(1))])],
            ),
        );
        let r = run(block_ret(
            vec![local_fn("loop", body)],
            vec![call(name("loop"), vec![int(10_000)])],
        ));
        assert_eq!(r, vec![s("done")]);
    }

    #[test]
    fn native_function_in_tail_position() {
        let f = func_body(&[], false, block_ret(vec![], vec![call(name("type"), vec![int(1)])]));
        let r = run(block_ret(vec![local_fn("f", f)], vec![call(name("f"), vec![])]));
        assert_eq!(r, vec![s("number")]);
    }

    fn unbounded_recursion() -> Block {
        let f = func_body(
            &[],
            false,
            block_ret(vec![], vec![add(int(1), call(name("f"), vec![]))]),
        );
        block_ret(vec![local_fn("f", f)], vec![call(name("pcall"), vec![name("f")])])
    }

    #[test]
    fn stack_overflow_is_caught_by_pcall() {
        let mut lua = LuaState::with_config(VmConfig::default().max_call_depth(40));
        let r = run_on(&mut lua, unbounded_recursion()).unwrap();
        assert_eq!(r, vec![LuaValue::Boolean(false), s("stack overflow")]);
        assert_eq!(lua.depth(), 1);
    }

    #[test]
    fn uncaught_stack_overflow_restores_the_frame_stack() {
        let f = func_body(
            &[],
            false,
            block_ret(vec![], vec![add(int(1), call(name("f"), vec![]))]),
        );
        let mut lua = LuaState::with_config(VmConfig::default().max_call_depth(40));
        let err = run_on(
            &mut lua,
            block_ret(vec![local_fn("f", f)], vec![call(name("f"), vec![])]),
        )
        .unwrap_err();
        assert_eq!(err, LuaError::StackOverflow);
        assert_eq!(lua.depth(), 1);
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    #[test]
    fn runtime_errors_propagate_to_the_host() {
        assert_eq!(
            run_err(block_ret(vec![], vec![add(int(1), table(vec![]))])),
            LuaError::TypeError {
                op: "perform arithmetic on",
                got: "table"
            }
        );
        assert_eq!(
            run_err(block(vec![call_stmt(name("undefined"), vec![])])),
            LuaError::NotCallable("nil")
        );
        assert_eq!(
            run_err(block(vec![call_stmt(name("error"), vec![string("boom")])])),
            LuaError::Value(s("boom"))
        );
    }

    #[test]
    fn pcall_converts_errors_to_values() {
        let index_nil = lambda(
            &[],
            block_ret(vec![local(&["x"], vec![])], vec![field(name("x"), "y")]),
        );
        let r = run(block_ret(vec![], vec![call(name("pcall"), vec![index_nil])]));
        assert_eq!(r, vec![LuaValue::Boolean(false), s("attempt to index a nil value")]);

        let payload = table(vec![named("_ERR", string("boom"))]);
        let r = run(block_ret(
            vec![],
            vec![call(name("pcall"), vec![name("error"), payload])],
        ));
        assert_eq!(r, vec![LuaValue::Boolean(false), s("boom")]);

        let r = run(block_ret(
            vec![],
            vec![call(name("pcall"), vec![name("error"), int(42)])],
        ));
        assert_eq!(r, vec![LuaValue::Boolean(false), s("unknown error")]);

        let r = run(block_ret(
            vec![],
            vec![call(name("pcall"), vec![name("error"), table(vec![])])],
        ));
        assert_eq!(r, vec![LuaValue::Boolean(false), s("unknown error")]);
    }

    #[test]
    fn pcall_success_passes_results_through() {
        let sum = lambda(&["a", "b"], block_ret(vec![], vec![add(name("a"), name("b"))]));
        let r = run(block_ret(
            vec![],
            vec![call(name("pcall"), vec![sum, int(2), int(3)])],
        ));
        assert_eq!(r, vec![LuaValue::Boolean(true), num(5)]);
    }

    #[test]
    fn unwinding_closes_captured_locals() {
        let body = lambda(
            &[],
            block(vec![
                local(&["v"], vec![int(42)]),
                assign(
                    vec![name("get")],
                    vec![lambda(&[], block_ret(vec![], vec![name("v")]))],
                ),
                call_stmt(name("error"), vec![string("x")]),
            ]),
        );
        let r = run(block_ret(
            vec![
                local(&["get"], vec![]),
                local(&["ok"], vec![call(name("pcall"), vec![body])]),
            ],
            vec![name("ok"), call(name("get"), vec![])],
        ));
        assert_eq!(r, vec![LuaValue::Boolean(false), num(42)]);
    }

    // ── Metatables ────────────────────────────────────────────────────────────

    fn with_meta(obj: Expr, mt: Expr) -> Expr {
        call(name("setmetatable"), vec![obj, mt])
    }

    #[test]
    fn index_metamethod_finds_methods() {
        let greet = lambda(
            &["self"],
            block_ret(
                vec![],
                vec![bin(BinOp::Concat, string("hi "), field(name("self"), "name"))],
            ),
        );
        let r = run(block_ret(
            vec![
                local(&["base"], vec![table(vec![named("greet", greet)])]),
                local(
                    &["obj"],
                    vec![with_meta(
                        table(vec![named("name", string("bob"))]),
                        table(vec![named("__index", name("base"))]),
                    )],
                ),
            ],
            vec![method(name("obj"), "greet", vec![])],
        ));
        assert_eq!(r, vec![s("hi bob")]);
    }

    #[test]
    fn call_metamethod_makes_tables_callable() {
        let double = lambda(
            &["self", "a"],
            block_ret(vec![], vec![bin(BinOp::Mul, name("a"), int(2))]),
        );
        let r = run(block_ret(
            vec![local(
                &["t"],
                vec![with_meta(table(vec![]), table(vec![named("__call", double)]))],
            )],
            vec![call(name("t"), vec![int(21)])],
        ));
        assert_eq!(r, vec![num(42)]);
    }

    #[test]
    fn arithmetic_and_length_metamethods() {
        let add_v = lambda(
            &["a", "b"],
            block_ret(vec![], vec![add(field(name("a"), "v"), field(name("b"), "v"))]),
        );
        let seven = lambda(&[], block_ret(vec![], vec![int(7)]));
        let r = run(block_ret(
            vec![
                local(&["mt"], vec![table(vec![named("__add", add_v), named("__len", seven)])]),
                local(&["a"], vec![with_meta(table(vec![named("v", int(1))]), name("mt"))]),
                local(&["b"], vec![with_meta(table(vec![named("v", int(2))]), name("mt"))]),
            ],
            vec![add(name("a"), name("b")), un(UnOp::Len, name("a"))],
        ));
        assert_eq!(r, vec![num(3), num(7)]);
    }

    #[test]
    fn newindex_metamethod_intercepts_new_keys() {
        let store = lambda(
            &["t", "k", "v"],
            block(vec![call_stmt(
                name("rawset"),
                vec![name("t"), name("k"), bin(BinOp::Mul, name("v"), int(10))],
            )]),
        );
        let r = run(block_ret(
            vec![
                local(
                    &["t"],
                    vec![with_meta(table(vec![]), table(vec![named("__newindex", store)]))],
                ),
                assign(vec![field(name("t"), "x")], vec![int(5)]),
                assign(vec![field(name("t"), "x")], vec![int(6)]),
            ],
            vec![field(name("t"), "x")],
        ));
        assert_eq!(r, vec![num(6)]);
    }
}
