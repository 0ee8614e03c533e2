use crate::closure::Closure;
use crate::table::{LuaTable, TableRef};
use std::sync::Arc;

/// All Lua value types, mirroring the Lua 5.3 type system.
#[derive(Clone, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    LuaString(String),
    /// A Lua or native closure.
    Function(Arc<Closure>),
    /// A Lua table (array + hash parts, reference-counted + interior mutability).
    Table(TableRef),
}

impl LuaValue {
    /// Returns the Lua type name string as per the reference manual.
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Integer(_) => "number",
            LuaValue::Float(_) => "number",
            LuaValue::LuaString(_) => "string",
            LuaValue::Function(_) => "function",
            LuaValue::Table(_) => "table",
        }
    }

    /// Returns `true` if the value is truthy in Lua's sense
    /// (everything except `nil` and `false` is truthy).
    pub fn is_truthy(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// Create a new empty table value.
    pub fn new_table() -> Self {
        LuaValue::Table(LuaTable::new().into_ref())
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Arc<Closure>> {
        match self {
            LuaValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Primitive equality without metamethods (`rawequal`).
    pub fn raw_equal(&self, other: &Self) -> bool {
        self == other
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<i64> for LuaValue {
    fn from(n: i64) -> Self {
        LuaValue::Integer(n)
    }
}

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        LuaValue::Float(n)
    }
}

impl From<&str> for LuaValue {
    fn from(s: &str) -> Self {
        LuaValue::LuaString(s.to_owned())
    }
}

impl From<String> for LuaValue {
    fn from(s: String) -> Self {
        LuaValue::LuaString(s)
    }
}

// Functions and tables compare by identity.
impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Float(b)) => (*a as f64) == *b,
            (LuaValue::Float(a), LuaValue::Integer(b)) => *a == (*b as f64),
            (LuaValue::LuaString(a), LuaValue::LuaString(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => Arc::ptr_eq(a, b),
            (LuaValue::Table(a), LuaValue::Table(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "LuaValue::Nil"),
            LuaValue::Boolean(b) => write!(f, "LuaValue::Boolean({b})"),
            LuaValue::Integer(n) => write!(f, "LuaValue::Integer({n})"),
            LuaValue::Float(n) => write!(f, "LuaValue::Float({n})"),
            LuaValue::LuaString(s) => write!(f, "LuaValue::LuaString({s:?})"),
            LuaValue::Function(c) => write!(f, "LuaValue::Function({:p})", Arc::as_ptr(c)),
            LuaValue::Table(t) => write!(f, "LuaValue::Table({:p})", Arc::as_ptr(t)),
        }
    }
}

impl std::fmt::Display for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Integer(n) => write!(f, "{n}"),
            LuaValue::Float(n) => {
                // Lua displays 1.0 as "1.0", not "1"
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{n:.1}")
                } else if n.is_infinite() {
                    write!(f, "{}", if *n > 0.0 { "inf" } else { "-inf" })
                } else {
                    write!(f, "{n}")
                }
            }
            LuaValue::LuaString(s) => write!(f, "{s}"),
            LuaValue::Function(c) => match c.as_ref() {
                Closure::Native(n) => write!(f, "function: builtin: {}", n.name),
                Closure::Lua(_) => write!(f, "function: {:p}", Arc::as_ptr(c)),
            },
            LuaValue::Table(t) => write!(f, "table: {:p}", Arc::as_ptr(t)),
        }
    }
}
