//! Operations that fall back to metamethods: indexing, arithmetic,
//! comparison, concatenation and length.

use crate::arith;
use crate::state::LuaState;
use lua_core::{LuaError, LuaValue, OpCode};
use tracing::trace;

/// Bound on `__index` / `__newindex` chains through tables.
const MAX_META_CHAIN: usize = 100;

/// The metamethod `event` of `v`, or nil. Only tables carry metatables.
pub(crate) fn metamethod(v: &LuaValue, event: &str) -> LuaValue {
    match v {
        LuaValue::Table(t) => {
            let mt = t.read().get_metatable();
            mt.map_or(LuaValue::Nil, |mt| mt.read().get_str(event))
        }
        _ => LuaValue::Nil,
    }
}

impl LuaState {
    /// Call `mm(args...)` on top of the current frame and return its first result.
    pub(crate) fn call_meta(&mut self, mm: LuaValue, args: &[LuaValue]) -> Result<LuaValue, LuaError> {
        self.stack.push(mm);
        for arg in args {
            self.stack.push(arg.clone());
        }
        self.call_value(args.len(), 1)?;
        Ok(self.stack.pop())
    }

    /// Binary metamethod of `a`, else of `b`; `None` when neither has one.
    fn try_binary_meta(
        &mut self,
        a: &LuaValue,
        b: &LuaValue,
        event: &str,
    ) -> Result<Option<LuaValue>, LuaError> {
        let mut mm = metamethod(a, event);
        if mm.is_nil() {
            mm = metamethod(b, event);
        }
        if mm.is_nil() {
            return Ok(None);
        }
        trace!(event, "metamethod");
        self.call_meta(mm, &[a.clone(), b.clone()]).map(Some)
    }

    // ── Indexing ──────────────────────────────────────────────────────────────

    /// `t[k]` honouring `__index`.
    pub(crate) fn index(&mut self, t: &LuaValue, k: &LuaValue) -> Result<LuaValue, LuaError> {
        let mut cur = t.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &cur {
                LuaValue::Table(tbl) => {
                    let raw = tbl.read().get(k);
                    if !raw.is_nil() {
                        return Ok(raw);
                    }
                    let h = metamethod(&cur, "__index");
                    if h.is_nil() {
                        return Ok(LuaValue::Nil);
                    }
                    h
                }
                other => {
                    let h = metamethod(other, "__index");
                    if h.is_nil() {
                        return Err(LuaError::TypeError {
                            op: "index",
                            got: other.type_name(),
                        });
                    }
                    h
                }
            };
            if let LuaValue::Function(_) = handler {
                return self.call_meta(handler, &[cur, k.clone()]);
            }
            cur = handler;
        }
        Err(LuaError::Runtime("'__index' chain too long; possible loop".into()))
    }

    /// `t[k] = v` honouring `__newindex`.
    pub(crate) fn set_index(
        &mut self,
        t: &LuaValue,
        k: LuaValue,
        v: LuaValue,
    ) -> Result<(), LuaError> {
        let mut cur = t.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &cur {
                LuaValue::Table(tbl) => {
                    let h = if tbl.read().get(&k).is_nil() {
                        metamethod(&cur, "__newindex")
                    } else {
                        LuaValue::Nil
                    };
                    if h.is_nil() {
                        return tbl
                            .write()
                            .set(k, v)
                            .map_err(|msg| LuaError::Runtime(msg.into()));
                    }
                    h
                }
                other => {
                    let h = metamethod(other, "__newindex");
                    if h.is_nil() {
                        return Err(LuaError::TypeError {
                            op: "index",
                            got: other.type_name(),
                        });
                    }
                    h
                }
            };
            if let LuaValue::Function(_) = handler {
                self.call_meta(handler, &[cur, k, v])?;
                return Ok(());
            }
            cur = handler;
        }
        Err(LuaError::Runtime("'__newindex' chain too long; possible loop".into()))
    }

    // ── Arithmetic ────────────────────────────────────────────────────────────

    pub(crate) fn arith(&mut self, op: OpCode, a: &LuaValue, b: &LuaValue) -> Result<LuaValue, LuaError> {
        if let Some(v) = arith::arith(op, a, b)? {
            return Ok(v);
        }
        if let Some(v) = self.try_binary_meta(a, b, arith::event_name(op))? {
            return Ok(v);
        }
        let culprit = if arith::to_number(a).is_none() { a } else { b };
        if arith::is_bitwise(op) {
            if arith::to_number(culprit).is_some() {
                return Err(LuaError::Runtime("number has no integer representation".into()));
            }
            return Err(LuaError::TypeError {
                op: "perform bitwise operation on",
                got: culprit.type_name(),
            });
        }
        Err(LuaError::TypeError {
            op: "perform arithmetic on",
            got: culprit.type_name(),
        })
    }

    /// Right-to-left concatenation of `values`, as `a .. (b .. c)`.
    pub(crate) fn concat(&mut self, values: Vec<LuaValue>) -> Result<LuaValue, LuaError> {
        let mut iter = values.into_iter().rev();
        let mut acc = iter.next().unwrap_or_default();
        for lhs in iter {
            acc = match (arith::to_concat_string(&lhs), arith::to_concat_string(&acc)) {
                (Some(l), Some(r)) => LuaValue::LuaString(l + &r),
                _ => match self.try_binary_meta(&lhs, &acc, "__concat")? {
                    Some(v) => v,
                    None => {
                        let culprit = if arith::to_concat_string(&lhs).is_none() { &lhs } else { &acc };
                        return Err(LuaError::TypeError {
                            op: "concatenate",
                            got: culprit.type_name(),
                        });
                    }
                },
            };
        }
        Ok(acc)
    }

    /// `#v` honouring `__len`.
    pub(crate) fn len(&mut self, v: &LuaValue) -> Result<LuaValue, LuaError> {
        if let LuaValue::LuaString(s) = v {
            return Ok(LuaValue::Integer(s.len() as i64));
        }
        let mm = metamethod(v, "__len");
        if !mm.is_nil() {
            return self.call_meta(mm, &[v.clone()]);
        }
        match v {
            LuaValue::Table(t) => Ok(LuaValue::Integer(t.read().length())),
            other => Err(LuaError::TypeError {
                op: "get length of",
                got: other.type_name(),
            }),
        }
    }

    // ── Comparison ────────────────────────────────────────────────────────────

    pub(crate) fn equals(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, LuaError> {
        if a == b {
            return Ok(true);
        }
        if let (LuaValue::Table(_), LuaValue::Table(_)) = (a, b) {
            if let Some(v) = self.try_binary_meta(a, b, "__eq")? {
                return Ok(v.is_truthy());
            }
        }
        Ok(false)
    }

    pub(crate) fn less_than(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, LuaError> {
        if let Some(r) = arith::less_than(a, b) {
            return Ok(r);
        }
        match self.try_binary_meta(a, b, "__lt")? {
            Some(v) => Ok(v.is_truthy()),
            None => Err(compare_error(a, b)),
        }
    }

    pub(crate) fn less_equal(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, LuaError> {
        if let Some(r) = arith::less_equal(a, b) {
            return Ok(r);
        }
        if let Some(v) = self.try_binary_meta(a, b, "__le")? {
            return Ok(v.is_truthy());
        }
        // a <= b as not (b < a)
        match self.try_binary_meta(b, a, "__lt")? {
            Some(v) => Ok(!v.is_truthy()),
            None => Err(compare_error(a, b)),
        }
    }
}

fn compare_error(a: &LuaValue, b: &LuaValue) -> LuaError {
    let (ta, tb) = (a.type_name(), b.type_name());
    if ta == tb {
        LuaError::Runtime(format!("attempt to compare two {ta} values"))
    } else {
        LuaError::Runtime(format!("attempt to compare {ta} with {tb}"))
    }
}
