//! Shorthand constructors for building trees by hand.
//!
//! Hosts that generate Lua programmatically (and the compiler's own tests)
//! use these instead of spelling out every node. All nodes are placed on
//! line 1.

use crate::ast::*;

const L: Line = 1;

// ── Expressions ──────────────────────────────────────────────────────────────

pub fn nil() -> Expr {
    Expr::Nil(L)
}

pub fn tt() -> Expr {
    Expr::True(L)
}

pub fn ff() -> Expr {
    Expr::False(L)
}

pub fn int(n: i64) -> Expr {
    Expr::Integer(n, L)
}

pub fn float(n: f64) -> Expr {
    Expr::Float(n, L)
}

pub fn string(s: &str) -> Expr {
    Expr::LuaString(s.to_owned(), L)
}

pub fn vararg() -> Expr {
    Expr::Vararg(L)
}

pub fn name(n: &str) -> Expr {
    Expr::Name(n.to_owned(), L)
}

pub fn paren(e: Expr) -> Expr {
    Expr::Paren(Box::new(e), L)
}

pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::BinOp {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        line: L,
    }
}

pub fn un(op: UnOp, operand: Expr) -> Expr {
    Expr::UnOp {
        op,
        operand: Box::new(operand),
        line: L,
    }
}

pub fn index(table: Expr, key: Expr) -> Expr {
    Expr::Index {
        table: Box::new(table),
        key: Box::new(key),
        line: L,
    }
}

pub fn field(table: Expr, f: &str) -> Expr {
    Expr::Field {
        table: Box::new(table),
        field: f.to_owned(),
        line: L,
    }
}

pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
    Expr::FnCall {
        func: Box::new(func),
        args,
        line: L,
    }
}

pub fn method(obj: Expr, m: &str, args: Vec<Expr>) -> Expr {
    Expr::MethodCall {
        obj: Box::new(obj),
        method: m.to_owned(),
        args,
        line: L,
    }
}

pub fn func(params: &[&str], vararg: bool, body: Block) -> Expr {
    Expr::FnDef(func_body(params, vararg, body))
}

pub fn func_body(params: &[&str], vararg: bool, body: Block) -> FuncBody {
    FuncBody {
        params: params.iter().map(|p| p.to_string()).collect(),
        vararg,
        body,
        line: L,
    }
}

pub fn table(fields: Vec<Field>) -> Expr {
    Expr::Table(fields, L)
}

/// A table constructor with positional entries only.
pub fn list(items: Vec<Expr>) -> Expr {
    table(items.into_iter().map(Field::Positional).collect())
}

// ── Statements ───────────────────────────────────────────────────────────────

pub fn block(stmts: Vec<Stmt>) -> Block {
    Block {
        stmts,
        ret: None,
        line: L,
    }
}

/// A block ending in `return values`.
pub fn block_ret(stmts: Vec<Stmt>, values: Vec<Expr>) -> Block {
    Block {
        stmts,
        ret: Some(ReturnStmt { values, line: L }),
        line: L,
    }
}

pub fn local(names: &[&str], values: Vec<Expr>) -> Stmt {
    Stmt::Local {
        names: names.iter().map(|n| n.to_string()).collect(),
        values,
        line: L,
    }
}

pub fn assign(targets: Vec<Expr>, values: Vec<Expr>) -> Stmt {
    Stmt::Assign {
        targets,
        values,
        line: L,
    }
}

pub fn call_stmt(func: Expr, args: Vec<Expr>) -> Stmt {
    Stmt::FnCall(call(func, args))
}

pub fn do_(body: Block) -> Stmt {
    Stmt::Do(body)
}

pub fn while_(cond: Expr, body: Block) -> Stmt {
    Stmt::While {
        cond,
        body,
        line: L,
    }
}

pub fn repeat(body: Block, cond: Expr) -> Stmt {
    Stmt::Repeat {
        body,
        cond,
        line: L,
    }
}

pub fn if_(cond: Expr, then: Block, elseifs: Vec<(Expr, Block)>, else_: Option<Block>) -> Stmt {
    Stmt::If {
        cond,
        then,
        elseifs,
        else_,
        line: L,
    }
}

pub fn numeric_for(var: &str, start: Expr, limit: Expr, step: Option<Expr>, body: Block) -> Stmt {
    Stmt::NumericFor {
        var: var.to_owned(),
        start,
        limit,
        step,
        body,
        line: L,
    }
}

pub fn generic_for(vars: &[&str], iterators: Vec<Expr>, body: Block) -> Stmt {
    Stmt::GenericFor {
        vars: vars.iter().map(|v| v.to_string()).collect(),
        iterators,
        body,
        line: L,
    }
}

/// `function a.b.c[:m](params) body end`
pub fn fn_def(path: &[&str], method: Option<&str>, body: FuncBody) -> Stmt {
    Stmt::FnDef {
        name: FuncName {
            parts: path.iter().map(|p| p.to_string()).collect(),
            method: method.map(str::to_owned),
        },
        body,
        line: L,
    }
}

pub fn local_fn(n: &str, body: FuncBody) -> Stmt {
    Stmt::LocalFn {
        name: n.to_owned(),
        body,
        line: L,
    }
}

pub fn brk() -> Stmt {
    Stmt::Break(L)
}
