//! The base library: host callbacks registered into the globals table.

use crate::arith;
use crate::meta::metamethod;
use lua_core::{Closure, LuaApi, LuaError, LuaValue, NativeFunction, TableRef, ThreadStatus, MULTRET};
use std::sync::Arc;

pub fn register(globals: &TableRef) {
    let fns: [(&'static str, NativeFunction); 16] = [
        ("print", lua_print),
        ("type", lua_type),
        ("tostring", lua_tostring),
        ("tonumber", lua_tonumber),
        ("assert", lua_assert),
        ("error", lua_error),
        ("pcall", lua_pcall),
        ("select", lua_select),
        ("rawget", lua_rawget),
        ("rawset", lua_rawset),
        ("rawequal", lua_rawequal),
        ("setmetatable", lua_setmetatable),
        ("getmetatable", lua_getmetatable),
        ("next", lua_next),
        ("pairs", lua_pairs),
        ("ipairs", lua_ipairs),
    ];
    let mut g = globals.write();
    for (name, func) in fns {
        // String keys are never rejected by a table.
        let _ = g.set(name.into(), native(name, func));
    }
}

fn native(name: &'static str, func: NativeFunction) -> LuaValue {
    LuaValue::Function(Arc::new(Closure::native(name, func)))
}

fn arg_error(n: usize, fname: &str, msg: &str) -> LuaError {
    LuaError::Runtime(format!("bad argument #{n} to '{fname}' ({msg})"))
}

fn check_table(api: &dyn LuaApi, n: usize, fname: &str) -> Result<TableRef, LuaError> {
    let v = api.get(n as isize);
    match v.as_table() {
        Some(t) => Ok(t.clone()),
        None => Err(arg_error(
            n,
            fname,
            &format!("table expected, got {}", type_or_none(api, n, &v)),
        )),
    }
}

fn type_or_none(api: &dyn LuaApi, n: usize, v: &LuaValue) -> &'static str {
    if n > api.get_top() {
        "no value"
    } else {
        v.type_name()
    }
}

fn check_any(api: &dyn LuaApi, n: usize, fname: &str) -> Result<LuaValue, LuaError> {
    if n > api.get_top() {
        return Err(arg_error(n, fname, "value expected"));
    }
    Ok(api.get(n as isize))
}

// ── Output and conversion ─────────────────────────────────────────────────────

fn lua_print(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let mut parts = Vec::with_capacity(api.get_top());
    for v in api.args() {
        parts.push(tostring(api, v)?);
    }
    println!("{}", parts.join("\t"));
    Ok(0)
}

/// `tostring` with `__tostring` support.
fn tostring(api: &mut dyn LuaApi, v: LuaValue) -> Result<String, LuaError> {
    let mm = metamethod(&v, "__tostring");
    if mm.is_nil() {
        return Ok(v.to_string());
    }
    api.push(mm);
    api.push(v);
    api.call(1, 1)?;
    match api.pop() {
        LuaValue::LuaString(s) => Ok(s),
        _ => Err(LuaError::Runtime("'__tostring' must return a string".into())),
    }
}

fn lua_tostring(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let v = check_any(api, 1, "tostring")?;
    let s = tostring(api, v)?;
    api.push(LuaValue::LuaString(s));
    Ok(1)
}

fn lua_type(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let v = check_any(api, 1, "type")?;
    api.push(v.type_name().into());
    Ok(1)
}

fn lua_tonumber(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let result = match api.get(2) {
        LuaValue::Nil => match check_any(api, 1, "tonumber")? {
            v @ (LuaValue::Integer(_) | LuaValue::Float(_)) => v,
            LuaValue::LuaString(s) => arith::parse_number(&s).unwrap_or_default(),
            _ => LuaValue::Nil,
        },
        base => {
            let base = match base {
                LuaValue::Integer(b) if (2..=36).contains(&b) => b as u32,
                _ => return Err(arg_error(2, "tonumber", "base out of range")),
            };
            match api.get(1) {
                LuaValue::LuaString(s) => arith::parse_int_base(&s, base)
                    .map(LuaValue::Integer)
                    .unwrap_or_default(),
                other => {
                    return Err(arg_error(
                        1,
                        "tonumber",
                        &format!("string expected, got {}", other.type_name()),
                    ))
                }
            }
        }
    };
    api.push(result);
    Ok(1)
}

// ── Errors ────────────────────────────────────────────────────────────────────

fn lua_assert(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let v = check_any(api, 1, "assert")?;
    if v.is_truthy() {
        return Ok(api.get_top());
    }
    match api.get(2) {
        LuaValue::Nil => Err(LuaError::Value("assertion failed!".into())),
        msg => Err(LuaError::Value(msg)),
    }
}

fn lua_error(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    Err(LuaError::Value(api.get(1)))
}

fn lua_pcall(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    check_any(api, 1, "pcall")?;
    let n_args = api.get_top() - 1;
    let status = api.pcall(n_args, MULTRET, 0)?;
    api.push(LuaValue::Boolean(status == ThreadStatus::Ok));
    api.insert(1)?;
    Ok(api.get_top())
}

// ── Varargs and raw access ────────────────────────────────────────────────────

fn lua_select(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let n = api.get_top() as i64;
    match api.get(1) {
        LuaValue::LuaString(s) if s == "#" => {
            api.push(LuaValue::Integer(n - 1));
            Ok(1)
        }
        v => {
            let i = arith::to_integer(&v)
                .ok_or_else(|| arg_error(1, "select", "number expected"))?;
            let i = if i < 0 { n + i } else { i.min(n) };
            if i < 1 {
                return Err(arg_error(1, "select", "index out of range"));
            }
            Ok((n - i) as usize)
        }
    }
}

fn lua_rawget(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let t = check_table(api, 1, "rawget")?;
    let v = t.read().get(&api.get(2));
    api.push(v);
    Ok(1)
}

fn lua_rawset(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let t = check_table(api, 1, "rawset")?;
    t.write()
        .set(api.get(2), api.get(3))
        .map_err(|msg| LuaError::Runtime(msg.into()))?;
    api.push(LuaValue::Table(t));
    Ok(1)
}

fn lua_rawequal(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let a = check_any(api, 1, "rawequal")?;
    let b = check_any(api, 2, "rawequal")?;
    api.push(LuaValue::Boolean(a.raw_equal(&b)));
    Ok(1)
}

// ── Metatables ────────────────────────────────────────────────────────────────

fn lua_setmetatable(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let t = check_table(api, 1, "setmetatable")?;
    let mt = match api.get(2) {
        LuaValue::Nil => None,
        LuaValue::Table(mt) => Some(mt),
        _ => return Err(arg_error(2, "setmetatable", "nil or table expected")),
    };
    t.write().set_metatable(mt);
    api.push(LuaValue::Table(t));
    Ok(1)
}

fn lua_getmetatable(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let mt = match api.get(1) {
        LuaValue::Table(t) => t.read().get_metatable(),
        _ => None,
    };
    api.push(mt.map_or(LuaValue::Nil, LuaValue::Table));
    Ok(1)
}

// ── Iteration ─────────────────────────────────────────────────────────────────

fn lua_next(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let t = check_table(api, 1, "next")?;
    let entry = t
        .read()
        .next(&api.get(2))
        .map_err(|msg| LuaError::Runtime(msg.into()))?;
    match entry {
        Some((k, v)) => {
            api.push(k);
            api.push(v);
            Ok(2)
        }
        None => {
            api.push(LuaValue::Nil);
            Ok(1)
        }
    }
}

fn lua_pairs(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let t = check_any(api, 1, "pairs")?;
    let mm = metamethod(&t, "__pairs");
    if !mm.is_nil() {
        api.push(mm);
        api.push(t);
        api.call(1, 3)?;
        return Ok(3);
    }
    check_table(api, 1, "pairs")?;
    api.push(native("next", lua_next));
    api.push(t);
    api.push(LuaValue::Nil);
    Ok(3)
}

fn ipairs_aux(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let t = api.get(1);
    let i = arith::to_integer(&api.get(2)).unwrap_or(0).wrapping_add(1);
    let v = api.get_table(&t, &LuaValue::Integer(i))?;
    if v.is_nil() {
        api.push(LuaValue::Nil);
        return Ok(1);
    }
    api.push(LuaValue::Integer(i));
    api.push(v);
    Ok(2)
}

fn lua_ipairs(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
    let t = check_any(api, 1, "ipairs")?;
    api.push(native("ipairs_aux", ipairs_aux));
    api.push(t);
    api.push(LuaValue::Integer(0));
    Ok(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LuaState;
    use lua_core::LuaTable;

    fn call_global(l: &mut LuaState, name: &str, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
        let base = l.get_top();
        let f = l.get_global(name);
        l.push(f);
        let n = args.len();
        for a in args {
            l.push(a);
        }
        l.call(n, MULTRET)?;
        let results = (base as isize + 1..=l.get_top() as isize).map(|i| l.get(i)).collect();
        l.set_top(base as isize)?;
        Ok(results)
    }

    #[test]
    fn type_and_tostring() {
        let mut l = LuaState::new();
        assert_eq!(call_global(&mut l, "type", vec![1.5.into()]).unwrap(), vec!["number".into()]);
        assert_eq!(
            call_global(&mut l, "tostring", vec![LuaValue::Float(2.0)]).unwrap(),
            vec!["2.0".into()]
        );
        assert!(call_global(&mut l, "type", vec![]).is_err());
    }

    #[test]
    fn tonumber_parses_and_rejects() {
        let mut l = LuaState::new();
        assert_eq!(call_global(&mut l, "tonumber", vec!["0x10".into()]).unwrap(), vec![LuaValue::Integer(16)]);
        assert_eq!(call_global(&mut l, "tonumber", vec!["z".into()]).unwrap(), vec![LuaValue::Nil]);
        assert_eq!(
            call_global(&mut l, "tonumber", vec!["777".into(), LuaValue::Integer(8)]).unwrap(),
            vec![LuaValue::Integer(511)]
        );
    }

    #[test]
    fn select_counts_and_slices() {
        let mut l = LuaState::new();
        let args = vec!["#".into(), LuaValue::Integer(1), LuaValue::Integer(2), LuaValue::Integer(3)];
        assert_eq!(call_global(&mut l, "select", args).unwrap(), vec![LuaValue::Integer(3)]);
        let args = vec![LuaValue::Integer(2), "a".into(), "b".into(), "c".into()];
        assert_eq!(call_global(&mut l, "select", args).unwrap(), vec!["b".into(), "c".into()]);
        let args = vec![LuaValue::Integer(-1), "a".into(), "b".into()];
        assert_eq!(call_global(&mut l, "select", args).unwrap(), vec!["b".into()]);
        assert!(call_global(&mut l, "select", vec![LuaValue::Integer(0)]).is_err());
    }

    #[test]
    fn pcall_reports_status_first() {
        let mut l = LuaState::new();
        let ty = l.get_global("type");
        let ok = call_global(&mut l, "pcall", vec![ty, LuaValue::Integer(1)]).unwrap();
        assert_eq!(ok, vec![true.into(), "number".into()]);
        let error = l.get_global("error");
        let err = call_global(&mut l, "pcall", vec![error, "oops".into()]).unwrap();
        assert_eq!(err, vec![false.into(), "oops".into()]);
        assert_eq!(l.depth(), 1);
    }

    #[test]
    fn assert_passes_values_through_or_raises() {
        let mut l = LuaState::new();
        assert_eq!(
            call_global(&mut l, "assert", vec![LuaValue::Integer(1), "m".into()]).unwrap(),
            vec![LuaValue::Integer(1), "m".into()]
        );
        assert_eq!(
            call_global(&mut l, "assert", vec![false.into()]),
            Err(LuaError::Value("assertion failed!".into()))
        );
    }

    #[test]
    fn ipairs_reads_through_index_metamethod() {
        let mut l = LuaState::new();
        let backing = LuaTable::new().into_ref();
        backing.write().set(LuaValue::Integer(1), "a".into()).unwrap();
        backing.write().set(LuaValue::Integer(2), "b".into()).unwrap();
        let mt = LuaTable::new().into_ref();
        mt.write().set("__index".into(), LuaValue::Table(backing)).unwrap();
        let proxy = LuaTable::new().into_ref();
        proxy.write().set_metatable(Some(mt));
        let proxy = LuaValue::Table(proxy);

        let r = call_global(&mut l, "ipairs", vec![proxy.clone()]).unwrap();
        let step = r[0].clone();
        let mut seen = Vec::new();
        let mut i = LuaValue::Integer(0);
        loop {
            l.push(step.clone());
            l.push(proxy.clone());
            l.push(i);
            l.call(2, 2).unwrap();
            let v = l.pop();
            i = l.pop();
            if i.is_nil() {
                break;
            }
            seen.push(v);
        }
        assert_eq!(seen, vec!["a".into(), "b".into()]);
    }

    #[test]
    fn raw_access_and_metatables() {
        let mut l = LuaState::new();
        let t = LuaValue::new_table();
        call_global(&mut l, "rawset", vec![t.clone(), "k".into(), LuaValue::Integer(7)]).unwrap();
        assert_eq!(call_global(&mut l, "rawget", vec![t.clone(), "k".into()]).unwrap(), vec![LuaValue::Integer(7)]);
        let mt = LuaValue::new_table();
        call_global(&mut l, "setmetatable", vec![t.clone(), mt.clone()]).unwrap();
        assert_eq!(call_global(&mut l, "getmetatable", vec![t.clone()]).unwrap(), vec![mt]);
        assert!(call_global(&mut l, "setmetatable", vec![LuaValue::Integer(1), LuaValue::Nil]).is_err());
        assert_eq!(
            call_global(&mut l, "rawequal", vec![t.clone(), t]).unwrap(),
            vec![true.into()]
        );
    }

    #[test]
    fn next_walks_array_then_hash() {
        let mut l = LuaState::new();
        let t = LuaValue::new_table();
        if let LuaValue::Table(tr) = &t {
            let mut w = tr.write();
            w.set(LuaValue::Integer(1), "a".into()).unwrap();
            w.set("x".into(), "b".into()).unwrap();
        }
        let first = call_global(&mut l, "next", vec![t.clone()]).unwrap();
        assert_eq!(first, vec![LuaValue::Integer(1), "a".into()]);
        let second = call_global(&mut l, "next", vec![t.clone(), LuaValue::Integer(1)]).unwrap();
        assert_eq!(second, vec!["x".into(), "b".into()]);
        let end = call_global(&mut l, "next", vec![t, "x".into()]).unwrap();
        assert_eq!(end, vec![LuaValue::Nil]);
    }
}
