//! Raw numeric semantics: arithmetic, bitwise operators, ordering and the
//! string/number coercions they rely on. Metamethod fallback lives in
//! [`crate::meta`]; everything here is pure.

use lua_core::table::float_to_int;
use lua_core::{LuaError, LuaValue, OpCode};

// ── Coercion helpers ──────────────────────────────────────────────────────────

/// Parse a Lua numeral: decimal or `0x` hex integers, then decimal floats.
pub(crate) fn parse_number(s: &str) -> Option<LuaValue> {
    let s = s.trim();
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        let n = u64::from_str_radix(hex, 16).ok()? as i64;
        return Some(LuaValue::Integer(if neg { n.wrapping_neg() } else { n }));
    }
    let numeric = !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !numeric {
        return None;
    }
    if let Ok(n) = s.parse::<i64>() {
        return Some(LuaValue::Integer(n));
    }
    s.parse::<f64>().ok().map(LuaValue::Float)
}

/// Parse `s` as an integer in `base` (2..=36).
pub(crate) fn parse_int_base(s: &str, base: u32) -> Option<i64> {
    let s = s.trim().to_ascii_lowercase();
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest.to_owned()),
        None => (false, s),
    };
    let n = i64::from_str_radix(&body, base).ok()?;
    Some(if neg { n.wrapping_neg() } else { n })
}

/// Numeric view of `v`, converting numeric strings.
pub(crate) fn to_number(v: &LuaValue) -> Option<LuaValue> {
    match v {
        LuaValue::Integer(_) | LuaValue::Float(_) => Some(v.clone()),
        LuaValue::LuaString(s) => parse_number(s),
        _ => None,
    }
}

pub(crate) fn to_float(v: &LuaValue) -> Option<f64> {
    match to_number(v)? {
        LuaValue::Integer(n) => Some(n as f64),
        LuaValue::Float(f) => Some(f),
        _ => None,
    }
}

/// Integer view of `v`; floats must have an exact integer value.
pub(crate) fn to_integer(v: &LuaValue) -> Option<i64> {
    match to_number(v)? {
        LuaValue::Integer(n) => Some(n),
        LuaValue::Float(f) => float_to_int(f),
        _ => None,
    }
}

/// String view used by concatenation.
pub(crate) fn to_concat_string(v: &LuaValue) -> Option<String> {
    match v {
        LuaValue::LuaString(s) => Some(s.clone()),
        LuaValue::Integer(_) | LuaValue::Float(_) => Some(v.to_string()),
        _ => None,
    }
}

// ── Arithmetic ────────────────────────────────────────────────────────────────

pub(crate) fn is_bitwise(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr | OpCode::BNot
    )
}

/// Metamethod event consulted when `op` has no raw result.
pub(crate) fn event_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "__add",
        OpCode::Sub => "__sub",
        OpCode::Mul => "__mul",
        OpCode::Mod => "__mod",
        OpCode::Pow => "__pow",
        OpCode::Div => "__div",
        OpCode::IDiv => "__idiv",
        OpCode::BAnd => "__band",
        OpCode::BOr => "__bor",
        OpCode::BXor => "__bxor",
        OpCode::Shl => "__shl",
        OpCode::Shr => "__shr",
        OpCode::Unm => "__unm",
        OpCode::BNot => "__bnot",
        _ => "__unknown",
    }
}

/// Apply `op` to two numbers. `Ok(None)` means an operand is not a number
/// (or, for bitwise operators, has no integer representation) and the
/// caller should try a metamethod. Unary operators ignore `b`.
pub(crate) fn arith(op: OpCode, a: &LuaValue, b: &LuaValue) -> Result<Option<LuaValue>, LuaError> {
    if is_bitwise(op) {
        let (Some(x), Some(y)) = (to_integer(a), to_integer(b)) else {
            return Ok(None);
        };
        return Ok(Some(LuaValue::Integer(bitwise(op, x, y))));
    }
    let (Some(x), Some(y)) = (to_number(a), to_number(b)) else {
        return Ok(None);
    };
    let value = match (op, x, y) {
        (OpCode::Div, x, y) => LuaValue::Float(float_of(&x) / float_of(&y)),
        (OpCode::Pow, x, y) => LuaValue::Float(float_of(&x).powf(float_of(&y))),
        (_, LuaValue::Integer(x), LuaValue::Integer(y)) => LuaValue::Integer(int_arith(op, x, y)?),
        (_, x, y) => LuaValue::Float(float_arith(op, float_of(&x), float_of(&y))),
    };
    Ok(Some(value))
}

fn float_of(v: &LuaValue) -> f64 {
    match v {
        LuaValue::Integer(n) => *n as f64,
        LuaValue::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn int_arith(op: OpCode, x: i64, y: i64) -> Result<i64, LuaError> {
    Ok(match op {
        OpCode::Add => x.wrapping_add(y),
        OpCode::Sub => x.wrapping_sub(y),
        OpCode::Mul => x.wrapping_mul(y),
        OpCode::Unm => x.wrapping_neg(),
        OpCode::IDiv => {
            if y == 0 {
                return Err(LuaError::Runtime("attempt to perform 'n//0'".into()));
            }
            floor_div(x, y)
        }
        OpCode::Mod => {
            if y == 0 {
                return Err(LuaError::Runtime("attempt to perform 'n%0'".into()));
            }
            floor_mod(x, y)
        }
        _ => return Err(LuaError::Internal(format!("{op:?} is not an integer operator"))),
    })
}

fn float_arith(op: OpCode, x: f64, y: f64) -> f64 {
    match op {
        OpCode::Add => x + y,
        OpCode::Sub => x - y,
        OpCode::Mul => x * y,
        OpCode::Unm => -x,
        OpCode::IDiv => (x / y).floor(),
        OpCode::Mod => {
            let m = x % y;
            if m != 0.0 && (m < 0.0) != (y < 0.0) {
                m + y
            } else {
                m
            }
        }
        _ => f64::NAN,
    }
}

/// Integer division rounding towards minus infinity.
fn floor_div(m: i64, n: i64) -> i64 {
    if n == -1 {
        return m.wrapping_neg();
    }
    let q = m / n;
    if m % n != 0 && (m ^ n) < 0 {
        q - 1
    } else {
        q
    }
}

/// Modulo taking the sign of the divisor.
fn floor_mod(m: i64, n: i64) -> i64 {
    if n == -1 {
        return 0;
    }
    let r = m % n;
    if r != 0 && (r ^ n) < 0 {
        r + n
    } else {
        r
    }
}

fn bitwise(op: OpCode, x: i64, y: i64) -> i64 {
    match op {
        OpCode::BAnd => x & y,
        OpCode::BOr => x | y,
        OpCode::BXor => x ^ y,
        OpCode::Shl => shift_left(x, y),
        OpCode::Shr => shift_left(x, y.wrapping_neg()),
        OpCode::BNot => !x,
        _ => 0,
    }
}

/// Logical shift; negative counts shift right, counts of 64 or more clear.
fn shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> -n) as i64
    }
}

// ── Comparison helpers ────────────────────────────────────────────────────────

/// Raw `a < b`; `None` when the pair is not comparable without metamethods.
pub(crate) fn less_than(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    Some(match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x < y,
        (LuaValue::Float(x), LuaValue::Float(y)) => x < y,
        (LuaValue::Integer(x), LuaValue::Float(y)) => (*x as f64) < *y,
        (LuaValue::Float(x), LuaValue::Integer(y)) => *x < (*y as f64),
        (LuaValue::LuaString(x), LuaValue::LuaString(y)) => x < y,
        _ => return None,
    })
}

/// Raw `a <= b`; `None` when the pair is not comparable without metamethods.
pub(crate) fn less_equal(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    Some(match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x <= y,
        (LuaValue::Float(x), LuaValue::Float(y)) => x <= y,
        (LuaValue::Integer(x), LuaValue::Float(y)) => (*x as f64) <= *y,
        (LuaValue::Float(x), LuaValue::Integer(y)) => *x <= (*y as f64),
        (LuaValue::LuaString(x), LuaValue::LuaString(y)) => x <= y,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> LuaValue {
        LuaValue::Integer(n)
    }

    fn apply(op: OpCode, a: LuaValue, b: LuaValue) -> LuaValue {
        arith(op, &a, &b).unwrap().unwrap()
    }

    #[test]
    fn integer_ops_stay_integers() {
        assert_eq!(apply(OpCode::Add, int(2), int(3)), int(5));
        assert_eq!(apply(OpCode::Mul, int(i64::MAX), int(2)), int(-2));
        assert!(matches!(apply(OpCode::Div, int(7), int(2)), LuaValue::Float(f) if f == 3.5));
        assert!(matches!(apply(OpCode::Pow, int(2), int(10)), LuaValue::Float(f) if f == 1024.0));
    }

    #[test]
    fn floor_division_and_modulo_follow_the_divisor_sign() {
        assert_eq!(apply(OpCode::IDiv, int(7), int(-2)), int(-4));
        assert_eq!(apply(OpCode::IDiv, int(-7), int(2)), int(-4));
        assert_eq!(apply(OpCode::Mod, int(-7), int(3)), int(2));
        assert_eq!(apply(OpCode::Mod, int(7), int(-3)), int(-2));
        assert_eq!(apply(OpCode::IDiv, int(i64::MIN), int(-1)), int(i64::MIN));
        assert!(matches!(
            apply(OpCode::Mod, LuaValue::Float(-7.0), int(3)),
            LuaValue::Float(f) if f == 2.0
        ));
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        assert!(arith(OpCode::IDiv, &int(1), &int(0)).is_err());
        assert!(arith(OpCode::Mod, &int(1), &int(0)).is_err());
        assert!(matches!(
            apply(OpCode::IDiv, LuaValue::Float(1.0), int(0)),
            LuaValue::Float(f) if f.is_infinite()
        ));
    }

    #[test]
    fn numeric_strings_are_coerced() {
        assert_eq!(apply(OpCode::Add, "10".into(), int(1)), int(11));
        assert!(matches!(apply(OpCode::Sub, "1.5".into(), int(1)), LuaValue::Float(f) if f == 0.5));
        assert_eq!(arith(OpCode::Add, &"abc".into(), &int(1)).unwrap(), None);
        assert_eq!(arith(OpCode::Add, &LuaValue::Nil, &int(1)).unwrap(), None);
    }

    #[test]
    fn bitwise_operators() {
        assert_eq!(apply(OpCode::BAnd, int(0b1100), int(0b1010)), int(0b1000));
        assert_eq!(apply(OpCode::Shl, int(1), int(4)), int(16));
        assert_eq!(apply(OpCode::Shr, int(-1), int(60)), int(15));
        assert_eq!(apply(OpCode::Shl, int(1), int(64)), int(0));
        assert_eq!(apply(OpCode::BNot, int(0), int(0)), int(-1));
        assert_eq!(apply(OpCode::BOr, LuaValue::Float(2.0), int(1)), int(3));
        assert_eq!(arith(OpCode::BOr, &LuaValue::Float(2.5), &int(1)).unwrap(), None);
    }

    #[test]
    fn parse_numerals() {
        assert_eq!(parse_number("42"), Some(int(42)));
        assert_eq!(parse_number(" 0x1F "), Some(int(31)));
        assert_eq!(parse_number("-0x10"), Some(int(-16)));
        assert_eq!(parse_number("1e2"), Some(LuaValue::Float(100.0)));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("nan"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_int_base("ff", 16), Some(255));
        assert_eq!(parse_int_base("-101", 2), Some(-5));
    }

    mod props {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn floor_division_and_modulo_agree(m in any::<i64>(), n in any::<i64>()) {
                prop_assume!(n != 0);
                let q = floor_div(m, n);
                let r = floor_mod(m, n);
                prop_assert_eq!(q.wrapping_mul(n).wrapping_add(r), m);
                prop_assert!(r == 0 || (r < 0) == (n < 0));
            }

            #[test]
            fn integer_strings_parse_back(n in any::<i64>()) {
                prop_assert_eq!(parse_number(&n.to_string()), Some(LuaValue::Integer(n)));
            }
        }
    }

    #[test]
    fn mixed_ordering() {
        assert_eq!(less_than(&int(1), &LuaValue::Float(1.5)), Some(true));
        assert_eq!(less_equal(&"a".into(), &"b".into()), Some(true));
        assert_eq!(less_than(&int(1), &"2".into()), None);
    }
}
