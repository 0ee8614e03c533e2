use crate::value::LuaValue;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Shared handle to a table.
pub type TableRef = Arc<RwLock<LuaTable>>;

/// A Lua table: an associative array keyed by any non-nil, non-NaN value.
///
/// Stores integer keys 1..n in a compact `array` part for fast sequential access;
/// everything else goes into the `hash` part, which keeps insertion order so
/// that `next` traversal is deterministic.
///
/// Clearing a field leaves a nil slot behind instead of removing it, so a
/// traversal can keep calling `next` with a key it has just cleared. Dead
/// hash slots are swept when the hash part would otherwise grow.
#[derive(Debug, Clone, Default)]
pub struct LuaTable {
    pub array: Vec<LuaValue>, // 1-indexed: array[i-1] = t[i]
    pub hash: IndexMap<HashKey, LuaValue>,
    pub metatable: Option<TableRef>,
}

/// Keys that can be stored in the hash part of a table.
#[derive(Debug, Clone)]
pub enum HashKey {
    Int(i64),
    /// Non-integral float, compared by bit pattern.
    Float(u64),
    Str(String),
    Bool(bool),
    /// Functions and tables, compared by identity.
    Ref(LuaValue),
}

impl HashKey {
    /// Normalize `v` into a key. `nil` and NaN have no key.
    pub fn from_value(v: &LuaValue) -> Option<HashKey> {
        match v {
            LuaValue::Nil => None,
            LuaValue::Integer(n) => Some(HashKey::Int(*n)),
            LuaValue::LuaString(s) => Some(HashKey::Str(s.clone())),
            LuaValue::Boolean(b) => Some(HashKey::Bool(*b)),
            LuaValue::Float(f) => {
                if f.is_nan() {
                    None
                } else if let Some(n) = float_to_int(*f) {
                    Some(HashKey::Int(n))
                } else {
                    Some(HashKey::Float(f.to_bits()))
                }
            }
            LuaValue::Function(_) | LuaValue::Table(_) => Some(HashKey::Ref(v.clone())),
        }
    }

    pub fn to_value(&self) -> LuaValue {
        match self {
            HashKey::Int(n) => LuaValue::Integer(*n),
            HashKey::Float(bits) => LuaValue::Float(f64::from_bits(*bits)),
            HashKey::Str(s) => LuaValue::LuaString(s.clone()),
            HashKey::Bool(b) => LuaValue::Boolean(*b),
            HashKey::Ref(v) => v.clone(),
        }
    }

    fn ref_addr(&self) -> usize {
        match self {
            HashKey::Ref(LuaValue::Function(f)) => Arc::as_ptr(f) as *const () as usize,
            HashKey::Ref(LuaValue::Table(t)) => Arc::as_ptr(t) as *const () as usize,
            _ => 0,
        }
    }
}

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HashKey::Int(a), HashKey::Int(b)) => a == b,
            (HashKey::Float(a), HashKey::Float(b)) => a == b,
            (HashKey::Str(a), HashKey::Str(b)) => a == b,
            (HashKey::Bool(a), HashKey::Bool(b)) => a == b,
            (HashKey::Ref(_), HashKey::Ref(_)) => self.ref_addr() == other.ref_addr(),
            _ => false,
        }
    }
}

impl Eq for HashKey {}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            HashKey::Int(n) => n.hash(state),
            HashKey::Float(bits) => bits.hash(state),
            HashKey::Str(s) => s.hash(state),
            HashKey::Bool(b) => b.hash(state),
            HashKey::Ref(_) => self.ref_addr().hash(state),
        }
    }
}

/// Exact float-to-integer conversion, `None` when `f` has a fractional part
/// or is out of range.
pub fn float_to_int(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= -9.223_372_036_854_776e18 && f < 9.223_372_036_854_776e18 {
        Some(f as i64)
    } else {
        None
    }
}

impl LuaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with pre-sized array and hash parts.
    pub fn with_capacity(narr: usize, nrec: usize) -> Self {
        Self {
            array: Vec::with_capacity(narr),
            hash: IndexMap::with_capacity(nrec),
            metatable: None,
        }
    }

    /// Wrap a table into a shared handle.
    pub fn into_ref(self) -> TableRef {
        Arc::new(RwLock::new(self))
    }

    pub fn get_metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, mt: Option<TableRef>) {
        self.metatable = mt;
    }

    fn array_index(&self, key: &LuaValue) -> Option<usize> {
        let i = match key {
            LuaValue::Integer(i) => *i,
            LuaValue::Float(f) => float_to_int(*f)?,
            _ => return None,
        };
        if i >= 1 && (i as u64) <= self.array.len() as u64 {
            Some((i - 1) as usize)
        } else {
            None
        }
    }

    /// Read `t[key]`. Returns `LuaValue::Nil` for missing keys.
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        if let Some(idx) = self.array_index(key) {
            return self.array[idx].clone();
        }
        HashKey::from_value(key)
            .and_then(|hk| self.hash.get(&hk))
            .cloned()
            .unwrap_or(LuaValue::Nil)
    }

    /// Shorthand for string-keyed reads such as metamethod lookups.
    pub fn get_str(&self, key: &str) -> LuaValue {
        self.hash
            .get(&HashKey::Str(key.to_owned()))
            .cloned()
            .unwrap_or(LuaValue::Nil)
    }

    /// Write `t[key] = val`. Setting to nil clears the entry.
    ///
    /// Fails for `nil` and NaN keys.
    pub fn set(&mut self, key: LuaValue, val: LuaValue) -> Result<(), &'static str> {
        if let Some(idx) = self.array_index(&key) {
            self.array[idx] = val;
            return Ok(());
        }
        let hk = match HashKey::from_value(&key) {
            Some(hk) => hk,
            None if key.is_nil() => return Err("index is nil"),
            None => return Err("index is NaN"),
        };
        if let HashKey::Int(n) = hk {
            if !val.is_nil() && n >= 1 && n as u64 == self.array.len() as u64 + 1 {
                self.array.push(val);
                self.hash.shift_remove(&hk);
                self.rehash_sequence();
                return Ok(());
            }
        }
        if let Some(slot) = self.hash.get_mut(&hk) {
            *slot = val;
        } else if !val.is_nil() {
            if self.hash.len() == self.hash.capacity() {
                self.hash.retain(|_, v| !v.is_nil());
            }
            self.hash.insert(hk, val);
        }
        Ok(())
    }

    /// Lua-style length: the border of the array sequence (largest n where t[n] ~= nil).
    pub fn length(&self) -> i64 {
        self.array.iter().rposition(|v| !v.is_nil()).map_or(0, |i| i as i64 + 1)
    }

    /// Traversal order: the array part first, then the hash part in insertion
    /// order. `Ok(None)` marks the end; an unknown key is an error.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, &'static str> {
        let mut hash_from = 0;
        if !key.is_nil() {
            if let Some(idx) = self.array_index(key) {
                if let Some(pos) = self.array[idx + 1..].iter().position(|v| !v.is_nil()) {
                    let i = idx + 1 + pos;
                    return Ok(Some((LuaValue::Integer(i as i64 + 1), self.array[i].clone())));
                }
            } else {
                let hk = HashKey::from_value(key).ok_or("invalid key to 'next'")?;
                hash_from = self.hash.get_index_of(&hk).ok_or("invalid key to 'next'")? + 1;
            }
        } else if let Some(i) = self.array.iter().position(|v| !v.is_nil()) {
            return Ok(Some((LuaValue::Integer(i as i64 + 1), self.array[i].clone())));
        }
        Ok(self
            .hash
            .iter()
            .skip(hash_from)
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.to_value(), v.clone())))
    }

    /// After a new integer key extends the array part, pull consecutive keys
    /// from the hash part into the array to keep the invariant.
    fn rehash_sequence(&mut self) {
        loop {
            let next = HashKey::Int(self.array.len() as i64 + 1);
            match self.hash.shift_remove(&next) {
                Some(v) if !v.is_nil() => self.array.push(v),
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> LuaValue {
        LuaValue::LuaString(v.into())
    }

    #[test]
    fn sequence_moves_from_hash_to_array() {
        let mut t = LuaTable::new();
        t.set(LuaValue::Integer(2), s("b")).unwrap();
        t.set(LuaValue::Integer(1), s("a")).unwrap();
        assert_eq!(t.array.len(), 2);
        assert_eq!(t.length(), 2);
        assert_eq!(t.get(&LuaValue::Float(2.0)), s("b"));
    }

    #[test]
    fn trailing_nil_shrinks_the_border() {
        let mut t = LuaTable::new();
        for i in 1..=3 {
            t.set(LuaValue::Integer(i), LuaValue::Integer(i)).unwrap();
        }
        t.set(LuaValue::Integer(3), LuaValue::Nil).unwrap();
        assert_eq!(t.length(), 2);
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut t = LuaTable::new();
        assert!(t.set(LuaValue::Nil, LuaValue::Integer(1)).is_err());
        assert!(t.set(LuaValue::Float(f64::NAN), LuaValue::Integer(1)).is_err());
        assert_eq!(t.get(&LuaValue::Nil), LuaValue::Nil);
    }

    #[test]
    fn tables_as_keys_use_identity() {
        let k1 = LuaValue::new_table();
        let k2 = LuaValue::new_table();
        let mut t = LuaTable::new();
        t.set(k1.clone(), s("one")).unwrap();
        assert_eq!(t.get(&k1), s("one"));
        assert_eq!(t.get(&k2), LuaValue::Nil);
    }

    #[test]
    fn next_walks_array_then_hash() {
        let mut t = LuaTable::new();
        t.set(LuaValue::Integer(1), s("a")).unwrap();
        t.set(s("x"), LuaValue::Integer(10)).unwrap();
        t.set(s("y"), LuaValue::Integer(20)).unwrap();

        let mut keys = Vec::new();
        let mut k = LuaValue::Nil;
        while let Some((nk, _)) = t.next(&k).unwrap() {
            keys.push(nk.clone());
            k = nk;
        }
        assert_eq!(keys, vec![LuaValue::Integer(1), s("x"), s("y")]);
        assert!(t.next(&s("missing")).is_err());
    }

    #[test]
    fn cleared_keys_still_continue_a_traversal() {
        let mut t = LuaTable::new();
        for i in 1..=3 {
            t.set(LuaValue::Integer(i), LuaValue::Integer(i)).unwrap();
        }
        for k in ["a", "b", "c"] {
            t.set(s(k), LuaValue::Boolean(true)).unwrap();
        }

        let mut seen = 0;
        let mut k = LuaValue::Nil;
        while let Some((nk, _)) = t.next(&k).unwrap() {
            t.set(nk.clone(), LuaValue::Nil).unwrap();
            seen += 1;
            k = nk;
        }
        assert_eq!(seen, 6);
        assert_eq!(t.length(), 0);
        assert_eq!(t.next(&LuaValue::Nil).unwrap(), None);
        assert_eq!(t.get(&s("b")), LuaValue::Nil);
    }

    #[test]
    fn dead_slots_are_swept_before_the_hash_grows() {
        let mut t = LuaTable::new();
        for i in 0..64 {
            let key = s(&format!("k{i}"));
            t.set(key.clone(), LuaValue::Integer(i)).unwrap();
            t.set(key, LuaValue::Nil).unwrap();
        }
        assert!(t.hash.len() < 64);
        t.set(s("live"), LuaValue::Integer(1)).unwrap();
        assert_eq!(t.next(&LuaValue::Nil).unwrap(), Some((s("live"), LuaValue::Integer(1))));
    }
}
