//! Per-function compilation state: register allocator, scope tracker,
//! constant pool and instruction emitter.

use indexmap::IndexMap;
use lua_core::opcode::{int2fb, MAXARG_BX, MAXARG_C, MAXARG_SBX};
use lua_core::{Instruction, LocVar, LuaError, LuaValue, OpCode, Proto, UpvalueDesc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Registers available to one function.
pub const MAX_REGISTERS: usize = 255;
/// Upvalues available to one function.
pub const MAX_UPVALUES: usize = 255;

// ── Locals, upvalues, loops ──────────────────────────────────────────────────

#[derive(Debug)]
struct LocalVar {
    name: String,
    slot: u8,
    /// Scope depth at declaration.
    depth: usize,
    captured: bool,
    /// Index of the matching debug entry in `loc_vars`.
    debug_idx: usize,
}

/// An upvalue slot as seen by the compiler.
#[derive(Debug, Clone)]
struct UpvalEntry {
    name: String,
    desc: UpvalueDesc,
}

/// Constant-pool identity: same type and same value. Floats compare by bit
/// pattern, so `1` and `1.0` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    /// Tables and functions never reach the pool from source code; keyed by identity.
    Ref(usize),
}

impl ConstKey {
    fn of(v: &LuaValue) -> Self {
        match v {
            LuaValue::Nil => ConstKey::Nil,
            LuaValue::Boolean(b) => ConstKey::Bool(*b),
            LuaValue::Integer(n) => ConstKey::Int(*n),
            LuaValue::Float(f) => ConstKey::Float(f.to_bits()),
            LuaValue::LuaString(s) => ConstKey::Str(s.clone()),
            LuaValue::Table(t) => ConstKey::Ref(Arc::as_ptr(t) as *const () as usize),
            LuaValue::Function(f) => ConstKey::Ref(Arc::as_ptr(f) as *const () as usize),
        }
    }
}

#[derive(Debug)]
struct LoopInfo {
    /// Scope depth of the loop's own scope.
    depth: usize,
    /// First register owned by the loop.
    base: u8,
    /// Pending `break` jumps.
    breaks: Vec<usize>,
    /// Was any local declared inside the loop captured by a closure?
    captured: bool,
}

// ── FuncState ────────────────────────────────────────────────────────────────

/// Tracks registers, scopes and emitted code for a single function body.
#[derive(Debug)]
pub(crate) struct FuncState {
    code: Vec<Instruction>,
    lines: Vec<u32>,
    constants: IndexMap<ConstKey, LuaValue>,
    upvalues: Vec<UpvalEntry>,
    protos: Vec<Arc<Proto>>,
    /// Active locals, innermost last.
    actives: Vec<LocalVar>,
    loc_vars: Vec<LocVar>,
    depth: usize,
    loops: Vec<LoopInfo>,
    used_regs: usize,
    max_regs: usize,
    /// Jumps emitted with a placeholder displacement.
    pending_jumps: BTreeSet<usize>,
    pub(crate) num_params: u8,
    pub(crate) is_vararg: bool,
    source: String,
    line_defined: u32,
}

impl FuncState {
    pub(crate) fn new(source: &str, line_defined: u32, is_vararg: bool) -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            constants: IndexMap::new(),
            upvalues: Vec::new(),
            protos: Vec::new(),
            actives: Vec::new(),
            loc_vars: Vec::new(),
            depth: 0,
            loops: Vec::new(),
            used_regs: 0,
            max_regs: 0,
            pending_jumps: BTreeSet::new(),
            num_params: 0,
            is_vararg,
            source: source.to_owned(),
            line_defined,
        }
    }

    /// State for a main chunk: vararg, with `_ENV` as upvalue 0.
    pub(crate) fn main(source: &str) -> Self {
        let mut fs = Self::new(source, 0, true);
        fs.upvalues.push(UpvalEntry {
            name: "_ENV".to_owned(),
            desc: UpvalueDesc::Stack(0),
        });
        fs
    }

    // ── Registers ─────────────────────────────────────────────────────────────

    pub(crate) fn used_regs(&self) -> usize {
        self.used_regs
    }

    /// Is `reg` the most recently allocated register?
    pub(crate) fn is_top(&self, reg: u8) -> bool {
        reg as usize + 1 == self.used_regs
    }

    pub(crate) fn alloc_reg(&mut self, line: u32) -> Result<u8, LuaError> {
        if self.used_regs >= MAX_REGISTERS {
            return Err(LuaError::compile(
                line,
                "function or expression needs too many registers",
            ));
        }
        let r = self.used_regs as u8;
        self.used_regs += 1;
        self.max_regs = self.max_regs.max(self.used_regs);
        Ok(r)
    }

    /// Allocate `n` consecutive registers and return the first.
    pub(crate) fn alloc_regs(&mut self, n: usize, line: u32) -> Result<u8, LuaError> {
        let first = self.used_regs;
        for _ in 0..n {
            self.alloc_reg(line)?;
        }
        Ok(first as u8)
    }

    pub(crate) fn free_reg(&mut self) {
        debug_assert!(self.used_regs > self.active_reg_count(), "freed a local's register");
        self.used_regs -= 1;
    }

    pub(crate) fn free_regs(&mut self, n: usize) {
        for _ in 0..n {
            self.free_reg();
        }
    }

    /// Drop every temporary above `mark` (a value previously read from
    /// [`FuncState::used_regs`]).
    pub(crate) fn reset_regs(&mut self, mark: usize) {
        debug_assert!(mark <= self.used_regs);
        self.used_regs = mark;
    }

    fn active_reg_count(&self) -> usize {
        self.actives.last().map_or(0, |l| l.slot as usize + 1)
    }

    // ── Scopes & locals ───────────────────────────────────────────────────────

    pub(crate) fn enter_scope(&mut self, breakable: bool) {
        self.depth += 1;
        if breakable {
            self.loops.push(LoopInfo {
                depth: self.depth,
                base: self.used_regs as u8,
                breaks: Vec::new(),
                captured: false,
            });
        }
    }

    /// Leave the innermost scope: retire its locals and, for a loop scope,
    /// patch every `break` to the current pc.
    pub(crate) fn exit_scope(&mut self) -> Result<(), LuaError> {
        let end_pc = self.pc();
        if self.loops.last().is_some_and(|l| l.depth == self.depth) {
            if let Some(lp) = self.loops.pop() {
                let a = if lp.captured { lp.base as u32 + 1 } else { 0 };
                for pc in lp.breaks {
                    self.set_jump_a(pc, a);
                    self.patch_jump(pc, end_pc)?;
                }
            }
        }
        while self.actives.last().is_some_and(|l| l.depth == self.depth) {
            if let Some(local) = self.actives.pop() {
                self.loc_vars[local.debug_idx].end_pc = end_pc;
                self.used_regs = local.slot as usize;
            }
        }
        self.depth -= 1;
        Ok(())
    }

    /// Allocate the next register and bind it to `name`.
    pub(crate) fn add_local(&mut self, name: &str, line: u32) -> Result<u8, LuaError> {
        let slot = self.alloc_reg(line)?;
        self.loc_vars.push(LocVar {
            name: name.to_owned(),
            start_pc: self.pc(),
            end_pc: 0,
        });
        self.actives.push(LocalVar {
            name: name.to_owned(),
            slot,
            depth: self.depth,
            captured: false,
            debug_idx: self.loc_vars.len() - 1,
        });
        Ok(slot)
    }

    /// Return the register for `name`, or `None` if it is not a local.
    pub(crate) fn slot_of(&self, name: &str) -> Option<u8> {
        self.actives
            .iter()
            .rposition(|l| l.name == name)
            .map(|i| self.actives[i].slot)
    }

    /// Resolve `name` as a local about to be captured by an inner function.
    pub(crate) fn capture_local(&mut self, name: &str) -> Option<u8> {
        let i = self.actives.iter().rposition(|l| l.name == name)?;
        let local = &mut self.actives[i];
        local.captured = true;
        let (slot, depth) = (local.slot, local.depth);
        for lp in self.loops.iter_mut().filter(|lp| lp.depth <= depth) {
            lp.captured = true;
        }
        Some(slot)
    }

    /// `A` operand for a `JMP` that closes the captured locals of the
    /// innermost scope, or 0 when nothing needs closing.
    pub(crate) fn jmp_arg_a(&self) -> u32 {
        let scope = self.actives.iter().rev().take_while(|l| l.depth == self.depth);
        let mut captured = false;
        let mut min_slot = self.max_regs as u32;
        for local in scope {
            captured |= local.captured;
            if !local.name.starts_with('(') {
                min_slot = min_slot.min(local.slot as u32);
            }
        }
        if captured {
            min_slot + 1
        } else {
            0
        }
    }

    /// Emit `JMP A 0` when the innermost scope has captured locals.
    pub(crate) fn close_open_upvals(&mut self, line: u32) {
        let a = self.jmp_arg_a();
        if a > 0 {
            self.emit_asbx(OpCode::Jmp, a, 0, line);
        }
    }

    /// Record a `break` out of the innermost loop.
    pub(crate) fn add_break(&mut self, line: u32) -> Result<(), LuaError> {
        if self.loops.is_empty() {
            return Err(LuaError::compile(line, "break outside a loop"));
        }
        let pc = self.emit_jump(OpCode::Jmp, 0, line);
        if let Some(lp) = self.loops.last_mut() {
            lp.breaks.push(pc);
        }
        Ok(())
    }

    // ── Upvalues ──────────────────────────────────────────────────────────────

    pub(crate) fn upvalue_index(&self, name: &str) -> Option<u8> {
        self.upvalues
            .iter()
            .position(|u| u.name == name)
            .map(|i| i as u8)
    }

    pub(crate) fn add_upvalue(
        &mut self,
        name: &str,
        desc: UpvalueDesc,
        line: u32,
    ) -> Result<u8, LuaError> {
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(LuaError::compile(line, "too many upvalues"));
        }
        self.upvalues.push(UpvalEntry {
            name: name.to_owned(),
            desc,
        });
        Ok((self.upvalues.len() - 1) as u8)
    }

    // ── Constants & sub-protos ────────────────────────────────────────────────

    /// Intern `value`, returning its constant-pool index.
    pub(crate) fn add_constant(&mut self, value: LuaValue) -> u32 {
        let (idx, _) = self.constants.insert_full(ConstKey::of(&value), value);
        idx as u32
    }

    pub(crate) fn add_proto(&mut self, proto: Proto) -> u32 {
        self.protos.push(Arc::new(proto));
        (self.protos.len() - 1) as u32
    }

    // ── Emitter ───────────────────────────────────────────────────────────────

    /// Index the next emitted instruction will get.
    pub(crate) fn pc(&self) -> usize {
        self.code.len()
    }

    pub(crate) fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.code.push(inst);
        self.lines.push(line);
        self.code.len() - 1
    }

    pub(crate) fn emit_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32, line: u32) -> usize {
        self.emit(Instruction::abc(op, a, b, c), line)
    }

    pub(crate) fn emit_abx(&mut self, op: OpCode, a: u32, bx: u32, line: u32) -> usize {
        self.emit(Instruction::abx(op, a, bx), line)
    }

    pub(crate) fn emit_asbx(&mut self, op: OpCode, a: u32, sbx: i32, line: u32) -> usize {
        self.emit(Instruction::asbx(op, a, sbx), line)
    }

    /// Emit a jump-like instruction whose displacement is patched later.
    pub(crate) fn emit_jump(&mut self, op: OpCode, a: u32, line: u32) -> usize {
        let pc = self.emit_asbx(op, a, 0, line);
        self.pending_jumps.insert(pc);
        pc
    }

    /// Point the jump at `pc` to `target` (`sBx = target - pc - 1`).
    pub(crate) fn patch_jump(&mut self, pc: usize, target: usize) -> Result<(), LuaError> {
        let sbx = target as i64 - pc as i64 - 1;
        if sbx.abs() > MAXARG_SBX as i64 {
            return Err(LuaError::compile(self.lines[pc], "control structure too long"));
        }
        self.code[pc].set_sbx(sbx as i32);
        self.pending_jumps.remove(&pc);
        Ok(())
    }

    pub(crate) fn set_jump_a(&mut self, pc: usize, a: u32) {
        self.code[pc].set_a(a);
    }

    pub(crate) fn emit_move(&mut self, a: u8, b: u8, line: u32) {
        self.emit_abc(OpCode::Move, a as u32, b as u32, 0, line);
    }

    /// `R(a) .. R(a+n-1) := nil`
    pub(crate) fn emit_load_nil(&mut self, a: u8, n: usize, line: u32) {
        self.emit_abc(OpCode::LoadNil, a as u32, n as u32 - 1, 0, line);
    }

    pub(crate) fn emit_load_bool(&mut self, a: u8, b: bool, skip: bool, line: u32) {
        self.emit_abc(OpCode::LoadBool, a as u32, b as u32, skip as u32, line);
    }

    pub(crate) fn emit_load_k(&mut self, a: u8, value: LuaValue, line: u32) {
        let idx = self.add_constant(value);
        if idx <= MAXARG_BX {
            self.emit_abx(OpCode::LoadK, a as u32, idx, line);
        } else {
            self.emit_abx(OpCode::LoadKx, a as u32, 0, line);
            self.emit(Instruction::ax(OpCode::ExtraArg, idx), line);
        }
    }

    /// `R(a) .. R(a+n-1) := vararg`; `n == -1` copies all of them.
    pub(crate) fn emit_vararg(&mut self, a: u8, n: i32, line: u32) {
        self.emit_abc(OpCode::VarArg, a as u32, (n + 1) as u32, 0, line);
    }

    pub(crate) fn emit_new_table(&mut self, a: u8, narr: usize, nrec: usize, line: u32) {
        self.emit_abc(
            OpCode::NewTable,
            a as u32,
            int2fb(narr as u32),
            int2fb(nrec as u32),
            line,
        );
    }

    /// Store `n` list items above `a` as batch `batch` (1-based); `n == 0`
    /// stores everything up to top.
    pub(crate) fn emit_set_list(&mut self, a: u8, n: usize, batch: usize, line: u32) {
        if batch as u32 <= MAXARG_C {
            self.emit_abc(OpCode::SetList, a as u32, n as u32, batch as u32, line);
        } else {
            self.emit_abc(OpCode::SetList, a as u32, n as u32, 0, line);
            self.emit(Instruction::ax(OpCode::ExtraArg, batch as u32), line);
        }
    }

    /// `n_args == -1` passes everything up to top; `n_results == -1` keeps all results.
    pub(crate) fn emit_call(&mut self, a: u8, n_args: i32, n_results: i32, line: u32) {
        self.emit_abc(
            OpCode::Call,
            a as u32,
            (n_args + 1) as u32,
            (n_results + 1) as u32,
            line,
        );
    }

    pub(crate) fn emit_tail_call(&mut self, a: u8, n_args: i32, line: u32) {
        self.emit_abc(OpCode::TailCall, a as u32, (n_args + 1) as u32, 0, line);
    }

    /// `n == -1` returns everything up to top.
    pub(crate) fn emit_return(&mut self, a: u8, n: i32, line: u32) {
        self.emit_abc(OpCode::Return, a as u32, (n + 1) as u32, 0, line);
    }

    pub(crate) fn emit_test(&mut self, a: u8, c: u32, line: u32) {
        self.emit_abc(OpCode::Test, a as u32, 0, c, line);
    }

    // ── Finish ────────────────────────────────────────────────────────────────

    /// Freeze the function into a [`Proto`]. Every placeholder jump must have
    /// been patched by now.
    pub(crate) fn finish(mut self, last_line: u32) -> Result<Proto, LuaError> {
        if let Some(pc) = self.pending_jumps.iter().next() {
            return Err(LuaError::Internal(format!(
                "unpatched jump at pc {pc} in {}",
                self.source
            )));
        }
        let end_pc = self.pc();
        for local in self.actives.drain(..) {
            self.loc_vars[local.debug_idx].end_pc = end_pc;
        }
        tracing::debug!(
            source = %self.source,
            line = self.line_defined,
            instructions = self.code.len(),
            constants = self.constants.len(),
            max_stack = self.max_regs.max(2),
            "finalized function prototype"
        );
        let (upvalue_names, upvalues): (Vec<String>, Vec<UpvalueDesc>) = self
            .upvalues
            .into_iter()
            .map(|u| (u.name, u.desc))
            .unzip();
        Ok(Proto {
            code: self.code,
            line_info: self.lines,
            constants: self.constants.into_values().collect(),
            upvalues,
            upvalue_names,
            protos: self.protos,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_regs.max(2) as u8,
            loc_vars: self.loc_vars,
            source: self.source,
            line_defined: self.line_defined,
            last_line_defined: last_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FuncState {
        FuncState::new("<test>", 0, false)
    }

    #[test]
    fn temporaries_are_lifo() {
        let mut f = fs();
        assert_eq!(f.alloc_reg(1).unwrap(), 0);
        assert_eq!(f.alloc_reg(1).unwrap(), 1);
        assert!(f.is_top(1));
        f.free_reg();
        assert_eq!(f.alloc_reg(1).unwrap(), 1);
        f.free_regs(2);
        assert_eq!(f.used_regs(), 0);
        assert_eq!(f.max_regs, 2);
    }

    #[test]
    fn register_limit_is_a_compile_error() {
        let mut f = fs();
        f.alloc_regs(MAX_REGISTERS, 7).unwrap();
        assert!(matches!(
            f.alloc_reg(7),
            Err(LuaError::Compile { line: 7, .. })
        ));
    }

    #[test]
    fn constants_are_deduplicated_by_type() {
        let mut f = fs();
        assert_eq!(f.add_constant(LuaValue::Integer(1)), 0);
        assert_eq!(f.add_constant(LuaValue::Float(1.0)), 1);
        assert_eq!(f.add_constant(LuaValue::from("x")), 2);
        assert_eq!(f.add_constant(LuaValue::Integer(1)), 0);
        assert_eq!(f.add_constant(LuaValue::from("x")), 2);
    }

    #[test]
    fn constant_index_beyond_bx_uses_loadkx() {
        let mut f = fs();
        for n in 0..=MAXARG_BX as i64 {
            f.add_constant(LuaValue::Integer(n));
        }
        f.emit_load_k(0, LuaValue::Integer(7), 1);
        f.emit_load_k(1, LuaValue::from("far"), 1);
        assert_eq!(f.code[0].opcode(), OpCode::LoadK);
        assert_eq!(f.code[0].bx(), 7);
        assert_eq!(f.code[1].opcode(), OpCode::LoadKx);
        assert_eq!(f.code[1].a(), 1);
        assert_eq!(f.code[2].opcode(), OpCode::ExtraArg);
        assert_eq!(f.code[2].ax_arg(), MAXARG_BX + 1);

        let proto = f.finish(1).unwrap();
        assert_eq!(proto.constants[MAXARG_BX as usize + 1], LuaValue::from("far"));
    }

    #[test]
    fn set_list_batch_beyond_c_uses_extraarg() {
        let mut f = fs();
        f.emit_set_list(0, 50, MAXARG_C as usize, 1);
        f.emit_set_list(0, 3, MAXARG_C as usize + 1, 1);
        assert_eq!(f.code[0].c(), MAXARG_C);
        assert_eq!(f.code[1].opcode(), OpCode::SetList);
        assert_eq!((f.code[1].b(), f.code[1].c()), (3, 0));
        assert_eq!(f.code[2].opcode(), OpCode::ExtraArg);
        assert_eq!(f.code[2].ax_arg(), MAXARG_C + 1);
    }

    #[test]
    fn locals_shadow_and_retire_with_scope() {
        let mut f = fs();
        f.add_local("x", 1).unwrap();
        f.enter_scope(false);
        let inner = f.add_local("x", 1).unwrap();
        assert_eq!(f.slot_of("x"), Some(inner));
        f.exit_scope().unwrap();
        assert_eq!(f.slot_of("x"), Some(0));
        assert_eq!(f.used_regs(), 1);
    }

    #[test]
    fn jump_patching_uses_next_pc_convention() {
        let mut f = fs();
        let j = f.emit_jump(OpCode::Jmp, 0, 1);
        f.emit_move(0, 1, 1);
        f.patch_jump(j, f.pc()).unwrap();
        assert_eq!(f.code[j].sbx(), 1);
        assert!(f.finish(1).is_ok());
    }

    #[test]
    fn unpatched_jump_fails_finish() {
        let mut f = fs();
        f.emit_jump(OpCode::Jmp, 0, 1);
        assert!(matches!(f.finish(1), Err(LuaError::Internal(_))));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let mut f = fs();
        assert!(matches!(f.add_break(3), Err(LuaError::Compile { line: 3, .. })));
    }

    #[test]
    fn captured_loop_local_makes_break_close_upvalues() {
        let mut f = fs();
        f.enter_scope(true);
        f.add_local("x", 1).unwrap();
        f.add_break(1).unwrap();
        assert_eq!(f.capture_local("x"), Some(0));
        assert_eq!(f.jmp_arg_a(), 1);
        f.exit_scope().unwrap();
        assert_eq!(f.code[0].a(), 1);
        assert_eq!(f.code[0].sbx(), 0);
    }
}
