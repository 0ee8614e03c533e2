use lua_core::{Closure, LuaError, LuaValue, Upvalue};
use std::sync::Arc;

// ── Call frame ────────────────────────────────────────────────────────────────

/// Registers and bookkeeping for one active call.
///
/// Slots `0..top` are live. For a Lua frame the registers are slots
/// `0..max_stack_size`; values pushed above them (call arguments, open
/// results) move `top`. The host API addresses the same slots 1-based.
#[derive(Debug)]
pub(crate) struct LuaStack {
    slots: Vec<LuaValue>,
    top: usize,
    /// The function running in this frame; `None` for the host's base frame.
    pub(crate) closure: Option<Arc<Closure>>,
    /// Arguments beyond the callee's fixed parameters.
    pub(crate) varargs: Vec<LuaValue>,
    pub(crate) pc: usize,
    /// Upvalue cells still pointing into this frame, by slot.
    open_upvals: Vec<(usize, Upvalue)>,
}

impl LuaStack {
    pub(crate) fn new(capacity: usize, closure: Option<Arc<Closure>>) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            top: 0,
            closure,
            varargs: Vec::new(),
            pc: 0,
            open_upvals: Vec::new(),
        }
    }

    pub(crate) fn top(&self) -> usize {
        self.top
    }

    pub(crate) fn push(&mut self, value: LuaValue) {
        if self.top < self.slots.len() {
            self.slots[self.top] = value;
        } else {
            self.slots.push(value);
        }
        self.top += 1;
    }

    pub(crate) fn pop(&mut self) -> LuaValue {
        if self.top == 0 {
            return LuaValue::Nil;
        }
        self.top -= 1;
        std::mem::take(&mut self.slots[self.top])
    }

    /// Pop the top `n` values, returned bottom first.
    pub(crate) fn pop_n(&mut self, n: usize) -> Vec<LuaValue> {
        let n = n.min(self.top);
        let start = self.top - n;
        let vals = self.slots[start..self.top]
            .iter_mut()
            .map(std::mem::take)
            .collect();
        self.top = start;
        vals
    }

    /// Push `vals` adjusted to `n` values (nil-padded or truncated);
    /// a negative `n` pushes all of them.
    pub(crate) fn push_n(&mut self, vals: Vec<LuaValue>, n: i32) {
        let want = if n < 0 { vals.len() } else { n as usize };
        let mut it = vals.into_iter();
        for _ in 0..want {
            self.push(it.next().unwrap_or_default());
        }
    }

    /// Resize the live region to `new_top`, nil-filling or clearing slots.
    pub(crate) fn set_top(&mut self, new_top: usize) {
        if new_top > self.slots.len() {
            self.slots.resize(new_top, LuaValue::Nil);
        }
        let (lo, hi) = if new_top > self.top {
            (self.top, new_top)
        } else {
            (new_top, self.top)
        };
        for slot in &mut self.slots[lo..hi] {
            *slot = LuaValue::Nil;
        }
        self.top = new_top;
    }

    /// Move `top` back over the register window without clearing it.
    pub(crate) fn reset_top(&mut self, new_top: usize) {
        if new_top > self.slots.len() {
            self.slots.resize(new_top, LuaValue::Nil);
        }
        self.top = new_top;
    }

    // ── Registers ─────────────────────────────────────────────────────────────

    pub(crate) fn reg(&self, r: usize) -> LuaValue {
        self.slots.get(r).cloned().unwrap_or_default()
    }

    pub(crate) fn set_reg(&mut self, r: usize, value: LuaValue) {
        if r >= self.slots.len() {
            self.slots.resize(r + 1, LuaValue::Nil);
        }
        self.slots[r] = value;
    }

    /// Live values from slot `from` up to top.
    pub(crate) fn values_from(&self, from: usize) -> Vec<LuaValue> {
        self.slots[from.min(self.top)..self.top].to_vec()
    }

    // ── 1-based host indices ──────────────────────────────────────────────────

    /// Absolute 1-based index for `idx` (negative counts from top).
    pub(crate) fn abs_index(&self, idx: isize) -> isize {
        if idx >= 0 {
            idx
        } else {
            self.top as isize + idx + 1
        }
    }

    pub(crate) fn get(&self, idx: isize) -> LuaValue {
        let abs = self.abs_index(idx);
        if abs < 1 || abs as usize > self.top {
            return LuaValue::Nil;
        }
        self.slots[abs as usize - 1].clone()
    }

    /// Move the top value to 1-based `idx`, shifting the values above it up.
    pub(crate) fn insert(&mut self, idx: isize) -> Result<(), LuaError> {
        let abs = self.abs_index(idx);
        if abs < 1 || abs as usize > self.top {
            return Err(LuaError::Runtime(format!("invalid stack index {idx}")));
        }
        self.slots[abs as usize - 1..self.top].rotate_right(1);
        Ok(())
    }

    /// Insert `value` at slot `slot`, shifting slot..top up by one.
    pub(crate) fn insert_at(&mut self, slot: usize, value: LuaValue) {
        self.push(value);
        self.slots[slot..self.top].rotate_right(1);
    }

    // ── Upvalues ──────────────────────────────────────────────────────────────

    /// The open cell for `slot`, created on first capture. Closures capturing
    /// the same local share one cell.
    pub(crate) fn open_upvalue(&mut self, frame: usize, slot: usize) -> Upvalue {
        if let Some((_, cell)) = self.open_upvals.iter().find(|(s, _)| *s == slot) {
            return cell.clone();
        }
        let cell = Upvalue::open(frame, slot);
        self.open_upvals.push((slot, cell.clone()));
        cell
    }

    /// Close every open cell at or above `from`, copying the value out of
    /// the frame.
    pub(crate) fn close_upvals(&mut self, from: usize) {
        let slots = &self.slots;
        self.open_upvals.retain(|(slot, cell)| {
            if *slot >= from {
                cell.close(slots.get(*slot).cloned().unwrap_or_default());
                false
            } else {
                true
            }
        });
    }
}
