use crate::chunk::Chunk;
use crate::func_state::FuncState;
use lua_ast::{Block, FuncBody};
use lua_core::{LuaError, UpvalueDesc};
use std::mem;

// ── Compiler ─────────────────────────────────────────────────────────────────

/// Compiles a Lua 5.3 AST into register-based [`Chunk`] bytecode.
///
/// The function being compiled lives in `fs`; the functions lexically
/// enclosing it are kept in `enclosing`, outermost first, so upvalue
/// resolution can walk outward through live state.
pub struct Compiler {
    source: String,
    pub(crate) fs: FuncState,
    enclosing: Vec<FuncState>,
}

impl Compiler {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            fs: FuncState::main(&source),
            source,
            enclosing: Vec::new(),
        }
    }

    /// Compile `block` as a main chunk and return the finished [`Chunk`].
    pub fn compile(mut self, block: &Block) -> Result<Chunk, LuaError> {
        self.compile_block(block)?;
        self.fs.emit_return(0, 0, block.line);
        let proto = self.fs.finish(block.line)?;
        tracing::debug!(source = %self.source, "compiled chunk");
        Ok(Chunk::new(proto))
    }

    // ── Functions & upvalues ──────────────────────────────────────────────────

    /// Compile a nested function and emit `CLOSURE` into `a`. Methods get an
    /// implicit leading `self` parameter.
    pub(crate) fn compile_function(
        &mut self,
        body: &FuncBody,
        a: u8,
        is_method: bool,
    ) -> Result<(), LuaError> {
        let child = FuncState::new(&self.source, body.line, body.vararg);
        let parent = mem::replace(&mut self.fs, child);
        self.enclosing.push(parent);

        if is_method {
            self.fs.add_local("self", body.line)?;
        }
        for param in &body.params {
            self.fs.add_local(param, body.line)?;
        }
        self.fs.num_params = (body.params.len() + is_method as usize) as u8;
        self.compile_block(&body.body)?;
        self.fs.emit_return(0, 0, body.body.line);

        let parent = self
            .enclosing
            .pop()
            .ok_or_else(|| LuaError::Internal("function nesting underflow".into()))?;
        let child = mem::replace(&mut self.fs, parent);
        let proto = child.finish(body.body.line)?;
        let idx = self.fs.add_proto(proto);
        self.fs
            .emit_abx(lua_core::OpCode::Closure, a as u32, idx, body.line);
        Ok(())
    }

    /// Upvalue index of `name` in the current function, capturing it from an
    /// enclosing function on first use. `None` means `name` is global.
    pub(crate) fn resolve_upvalue(&mut self, name: &str, line: u32) -> Result<Option<u8>, LuaError> {
        if let Some(idx) = self.fs.upvalue_index(name) {
            return Ok(Some(idx));
        }
        match self.capture(self.enclosing.len(), name, line)? {
            Some(desc) => self.fs.add_upvalue(name, desc, line).map(Some),
            None => Ok(None),
        }
    }

    /// How the function at nesting `level` (0 is the main chunk) captures
    /// `name` from its parent, registering intermediate upvalues on the way.
    fn capture(&mut self, level: usize, name: &str, line: u32) -> Result<Option<UpvalueDesc>, LuaError> {
        if level == 0 {
            return Ok(None);
        }
        let parent = &mut self.enclosing[level - 1];
        if let Some(slot) = parent.capture_local(name) {
            return Ok(Some(UpvalueDesc::Stack(slot)));
        }
        if let Some(idx) = parent.upvalue_index(name) {
            return Ok(Some(UpvalueDesc::Upvalue(idx)));
        }
        match self.capture(level - 1, name, line)? {
            Some(desc) => {
                let idx = self.enclosing[level - 1].add_upvalue(name, desc, line)?;
                Ok(Some(UpvalueDesc::Upvalue(idx)))
            }
            None => Ok(None),
        }
    }
}

/// Compile a main chunk named `source`.
pub fn compile(block: &Block, source: &str) -> Result<Chunk, LuaError> {
    Compiler::new(source).compile(block)
}
