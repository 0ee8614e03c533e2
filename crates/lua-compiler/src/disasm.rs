use lua_core::{LuaValue, Proto, UpvalueDesc};
use std::fmt::Write;

/// Disassemble a [`Proto`] into a human-readable string.
///
/// Recursively disassembles any nested `protos[]` so you see the full picture.
pub fn disassemble(proto: &Proto) -> String {
    let mut out = String::new();
    disasm_proto(proto, &mut out);
    out
}

/// One-line listing of a function's code:
/// `[max_stack/loc_vars] inst; inst; ...`, instructions in `name(a,b,c)` form.
pub fn listing(proto: &Proto) -> String {
    let code: Vec<String> = proto.code.iter().map(|i| i.to_string()).collect();
    format!(
        "[{}/{}] {}",
        proto.max_stack_size,
        proto.loc_vars.len(),
        code.join("; ")
    )
}

fn disasm_proto(proto: &Proto, out: &mut String) {
    let name = if proto.source.is_empty() {
        "<?>"
    } else {
        proto.source.as_str()
    };
    let _ = writeln!(
        out,
        "== {}:{} ==  (params={}, vararg={}, stack={})",
        name, proto.line_defined, proto.num_params, proto.is_vararg, proto.max_stack_size
    );

    if !proto.constants.is_empty() {
        out.push_str("constants:\n");
        for (i, c) in proto.constants.iter().enumerate() {
            let _ = writeln!(out, "  [K{i}]  {}", fmt_value(c));
        }
    }

    if !proto.loc_vars.is_empty() {
        out.push_str("locals:\n");
        for (i, lv) in proto.loc_vars.iter().enumerate() {
            let _ = writeln!(out, "  [L{i}]  {}  pc {}..{}", lv.name, lv.start_pc, lv.end_pc);
        }
    }

    if !proto.upvalues.is_empty() {
        out.push_str("upvalues:\n");
        for (i, uv) in proto.upvalues.iter().enumerate() {
            let desc = match uv {
                UpvalueDesc::Stack(reg) => format!("stack reg={reg}"),
                UpvalueDesc::Upvalue(idx) => format!("upvalue idx={idx}"),
            };
            let name = proto.upvalue_names.get(i).map_or("?", String::as_str);
            let _ = writeln!(out, "  [U{i}]  {name}  {desc}");
        }
    }

    out.push_str("instructions:\n");
    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.line_info.get(pc).copied().unwrap_or(0);
        let _ = write!(out, "  {pc:04}  [{line}]  {inst}");
        if inst.is_jump() {
            let target = pc as i64 + 1 + inst.sbx() as i64;
            let _ = write!(out, "  ; to {target}");
        }
        out.push('\n');
    }

    for (i, sub) in proto.protos.iter().enumerate() {
        out.push('\n');
        let _ = writeln!(out, "-- sub-proto {i} (of {}) --", proto.source);
        disasm_proto(sub, out);
    }
}

fn fmt_value(v: &LuaValue) -> String {
    match v {
        LuaValue::LuaString(s) => format!("{s:?}"),
        _ => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Compiler;
    use lua_ast::build::*;

    #[test]
    fn listing_of_empty_chunk() {
        let chunk = Compiler::new("<test>").compile(&block(vec![])).unwrap();
        assert_eq!(listing(&chunk.proto), "[2/0] return(0,1,_)");
    }

    #[test]
    fn disassembly_shows_sections_and_sub_protos() {
        let f = func(&["x"], false, block_ret(vec![], vec![name("x")]));
        let chunk = Compiler::new("demo")
            .compile(&block(vec![
                local(&["f"], vec![f]),
                call_stmt(name("print"), vec![string("hi"), float(1.5)]),
            ]))
            .unwrap();
        let text = disassemble(&chunk.proto);
        assert!(text.starts_with("== demo:0 ==  (params=0, vararg=true"));
        assert!(text.contains("[K0]  \"print\""));
        assert!(text.contains("[K2]  1.5"));
        assert!(text.contains("[U0]  _ENV  stack reg=0"));
        assert!(text.contains("[L0]  f"));
        assert!(text.contains("closure(0,0)"));
        assert!(text.contains("-- sub-proto 0 (of demo) --"));
        assert!(text.contains("(params=1, vararg=false"));
    }

    #[test]
    fn jumps_show_their_target() {
        let chunk = Compiler::new("<test>")
            .compile(&block(vec![while_(tt(), block(vec![brk()]))]))
            .unwrap();
        let text = disassemble(&chunk.proto);
        assert!(text.contains("jmp(0,1)  ; to 2"));
        assert!(text.contains("jmp(0,-2)  ; to 0"));
    }
}
