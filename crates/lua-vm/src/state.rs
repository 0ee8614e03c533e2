use crate::config::VmConfig;
use crate::meta::metamethod;
use crate::stack::LuaStack;
use crate::stdlib;
use lua_compiler::Chunk;
use lua_core::{
    Closure, LuaApi, LuaError, LuaTable, LuaValue, NativeFunction, TableRef, ThreadStatus,
    Upvalue, MULTRET,
};
use std::sync::Arc;
use tracing::{debug, trace};

// ── Interpreter state ─────────────────────────────────────────────────────────

/// A Lua interpreter: the frame stack, the globals table and runtime limits.
///
/// The current frame is held apart from its callers so that the host API
/// always has one to work on; frame `i` is `callers[i]` below the current
/// one, and the current frame's index is `callers.len()`.
pub struct LuaState {
    pub(crate) stack: LuaStack,
    callers: Vec<LuaStack>,
    globals: TableRef,
    config: VmConfig,
}

impl Default for LuaState {
    fn default() -> Self {
        Self::new()
    }
}

impl LuaState {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    /// A state with the base library registered in its globals.
    pub fn with_config(config: VmConfig) -> Self {
        let globals = LuaTable::new().into_ref();
        stdlib::register(&globals);
        Self {
            stack: LuaStack::new(config.min_stack, None),
            callers: Vec::new(),
            globals,
            config,
        }
    }

    /// Number of live frames, the host's base frame included.
    pub fn depth(&self) -> usize {
        self.callers.len() + 1
    }

    pub fn get_global(&self, name: &str) -> LuaValue {
        self.globals.read().get_str(name)
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) -> Result<(), LuaError> {
        self.globals
            .write()
            .set(LuaValue::from(name), value)
            .map_err(|msg| LuaError::Runtime(msg.into()))
    }

    /// Expose a host function as a global.
    pub fn register(&mut self, name: &'static str, func: NativeFunction) -> Result<(), LuaError> {
        self.set_global(name, LuaValue::Function(Arc::new(Closure::native(name, func))))
    }

    // ── Loading and running chunks ───────────────────────────────────────────

    /// Push the main function of `chunk`, its `_ENV` bound to the globals.
    pub fn load(&mut self, chunk: &Chunk) {
        let env = LuaValue::Table(self.globals.clone());
        let upvals = chunk
            .proto
            .upvalues
            .iter()
            .enumerate()
            .map(|(i, _)| Upvalue::closed(if i == 0 { env.clone() } else { LuaValue::Nil }))
            .collect();
        let main = Closure::lua(chunk.proto.clone(), upvals);
        self.stack.push(LuaValue::Function(Arc::new(main)));
    }

    /// Load and call `chunk`, returning everything it returns. On failure
    /// the frame stack is restored to where it was.
    pub fn execute(&mut self, chunk: &Chunk) -> Result<Vec<LuaValue>, LuaError> {
        let depth = self.callers.len();
        let base = self.stack.top();
        self.load(chunk);
        match self.call_value(0, MULTRET) {
            Ok(()) => {
                let n = self.stack.top() - base;
                Ok(self.stack.pop_n(n))
            }
            Err(err) => {
                self.unwind_to(depth);
                self.stack.set_top(base);
                Err(err)
            }
        }
    }

    /// Bytecode serialization is not provided.
    pub fn dump(&self) -> Result<Vec<u8>, LuaError> {
        Err(LuaError::Unsupported("dump"))
    }

    /// Calls with continuations are not provided.
    pub fn call_k(
        &mut self,
        _n_args: usize,
        _n_results: i32,
        _ctx: isize,
        _k: NativeFunction,
    ) -> Result<(), LuaError> {
        Err(LuaError::Unsupported("call with continuation"))
    }

    pub fn pcall_k(
        &mut self,
        _n_args: usize,
        _n_results: i32,
        _msgh: i32,
        _ctx: isize,
        _k: NativeFunction,
    ) -> Result<ThreadStatus, LuaError> {
        Err(LuaError::Unsupported("protected call with continuation"))
    }

    // ── Frames ───────────────────────────────────────────────────────────────

    /// Index of the current frame.
    pub(crate) fn frame_index(&self) -> usize {
        self.callers.len()
    }

    pub(crate) fn frame(&self, idx: usize) -> Option<&LuaStack> {
        if idx == self.callers.len() {
            Some(&self.stack)
        } else {
            self.callers.get(idx)
        }
    }

    pub(crate) fn frame_mut(&mut self, idx: usize) -> Option<&mut LuaStack> {
        if idx == self.callers.len() {
            Some(&mut self.stack)
        } else {
            self.callers.get_mut(idx)
        }
    }

    fn push_frame(&mut self, frame: LuaStack) -> Result<(), LuaError> {
        if self.depth() >= self.config.max_call_depth {
            return Err(LuaError::StackOverflow);
        }
        let caller = std::mem::replace(&mut self.stack, frame);
        self.callers.push(caller);
        Ok(())
    }

    /// Tear down the current frame, closing its open upvalues.
    fn pop_frame(&mut self) -> Result<LuaStack, LuaError> {
        let caller = self
            .callers
            .pop()
            .ok_or_else(|| LuaError::Internal("pop of the base frame".into()))?;
        self.stack.close_upvals(0);
        Ok(std::mem::replace(&mut self.stack, caller))
    }

    /// Pop frames until the current one has index `depth`.
    fn unwind_to(&mut self, depth: usize) {
        while self.callers.len() > depth {
            if self.pop_frame().is_err() {
                break;
            }
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    /// Call the value sitting below `n_args` arguments on the current frame,
    /// leaving `n_results` results (all of them for a negative count) in its
    /// place.
    pub(crate) fn call_value(&mut self, n_args: usize, n_results: i32) -> Result<(), LuaError> {
        let func_slot = self
            .stack
            .top()
            .checked_sub(n_args + 1)
            .ok_or_else(|| LuaError::Internal("call below the stack bottom".into()))?;
        let (closure, n_args) = self.resolve_callee(func_slot, n_args)?;
        trace!(depth = self.depth(), n_args, n_results, "call");
        let produced = match &*closure {
            Closure::Lua(_) => self.call_lua(closure.clone(), n_args, n_results)?,
            Closure::Native(native) => self.call_native(closure.clone(), native.func, n_args, n_results)?,
        };
        trace!(depth = self.depth(), produced, "return");
        Ok(())
    }

    /// The closure to run for the value at `func_slot`. A value with a
    /// `__call` metamethod is replaced by the metamethod and passed as the
    /// first argument.
    pub(crate) fn resolve_callee(
        &mut self,
        func_slot: usize,
        n_args: usize,
    ) -> Result<(Arc<Closure>, usize), LuaError> {
        let callee = self.stack.reg(func_slot);
        if let Some(c) = callee.as_function() {
            return Ok((c.clone(), n_args));
        }
        match metamethod(&callee, "__call") {
            LuaValue::Function(mm) => {
                self.stack.set_reg(func_slot, LuaValue::Function(mm.clone()));
                self.stack.insert_at(func_slot + 1, callee);
                Ok((mm, n_args + 1))
            }
            _ => Err(LuaError::NotCallable(callee.type_name())),
        }
    }

    /// Move a Lua callee and its arguments off the current frame into a
    /// fresh frame for it.
    pub(crate) fn enter_lua(&mut self, closure: Arc<Closure>, n_args: usize) -> Result<LuaStack, LuaError> {
        let proto = match &*closure {
            Closure::Lua(lc) => lc.proto.clone(),
            Closure::Native(n) => {
                return Err(LuaError::Internal(format!("{} is not a Lua function", n.name)))
            }
        };
        let n_regs = proto.max_stack_size as usize;
        let n_params = proto.num_params as usize;
        let mut args = self.stack.pop_n(n_args);
        self.stack.pop();

        let mut frame = LuaStack::new(n_regs + self.config.min_stack, Some(closure));
        if proto.is_vararg && args.len() > n_params {
            frame.varargs = args.split_off(n_params);
        }
        frame.push_n(args, n_params as i32);
        frame.reset_top(n_regs);
        Ok(frame)
    }

    fn call_lua(&mut self, closure: Arc<Closure>, n_args: usize, n_results: i32) -> Result<usize, LuaError> {
        let frame = self.enter_lua(closure, n_args)?;
        self.push_frame(frame)?;
        let results = self.run()?;
        self.pop_frame()?;
        let produced = results.len();
        self.stack.push_n(results, n_results);
        Ok(produced)
    }

    fn call_native(
        &mut self,
        closure: Arc<Closure>,
        func: NativeFunction,
        n_args: usize,
        n_results: i32,
    ) -> Result<usize, LuaError> {
        let args = self.stack.pop_n(n_args);
        self.stack.pop();
        let mut frame = LuaStack::new(self.config.min_stack, Some(closure));
        frame.push_n(args, MULTRET);
        self.push_frame(frame)?;

        let n = func(self)?;
        let results = self.stack.pop_n(n);
        self.pop_frame()?;
        let produced = results.len();
        self.stack.push_n(results, n_results);
        Ok(produced)
    }

    /// Call inside an error boundary. See [`LuaApi::pcall`].
    pub(crate) fn protected_call(
        &mut self,
        n_args: usize,
        n_results: i32,
        msgh: i32,
    ) -> Result<ThreadStatus, LuaError> {
        if msgh > 0 {
            return Err(LuaError::Unsupported("message handler"));
        }
        let depth = self.callers.len();
        let func_slot = self.stack.top().saturating_sub(n_args + 1);
        let err = match self.call_value(n_args, n_results) {
            Ok(()) => return Ok(ThreadStatus::Ok),
            Err(err) => err,
        };
        debug!(
            error = %err,
            unwound = self.callers.len() - depth,
            "protected call caught an error"
        );
        self.unwind_to(depth);
        self.stack.set_top(func_slot);
        let obj = error_object(err);
        if msgh < 0 {
            return Err(LuaError::Value(obj));
        }
        self.stack.push(obj);
        Ok(ThreadStatus::ErrRun)
    }
}

/// The Lua value a caught error is reported as: the `_ERR` field of a raised
/// table, a raised string, or the text of an engine error. Anything else,
/// including a table without `_ERR`, is reported as "unknown error".
pub(crate) fn error_object(err: LuaError) -> LuaValue {
    let unknown = || LuaValue::from("unknown error");
    match err {
        LuaError::Value(LuaValue::Table(t)) => {
            let field = t.read().get_str("_ERR");
            if field.is_nil() {
                unknown()
            } else {
                field
            }
        }
        LuaError::Value(s @ LuaValue::LuaString(_)) => s,
        LuaError::Value(_) => unknown(),
        other => LuaValue::LuaString(other.to_string()),
    }
}

// ── Host API ──────────────────────────────────────────────────────────────────

impl LuaApi for LuaState {
    fn get_top(&self) -> usize {
        self.stack.top()
    }

    fn get(&self, idx: isize) -> LuaValue {
        self.stack.get(idx)
    }

    fn push(&mut self, value: LuaValue) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> LuaValue {
        self.stack.pop()
    }

    fn set_top(&mut self, idx: isize) -> Result<(), LuaError> {
        let abs = self.stack.abs_index(idx);
        if abs < 0 {
            return Err(LuaError::Runtime(format!("invalid new top {idx}")));
        }
        self.stack.set_top(abs as usize);
        Ok(())
    }

    fn insert(&mut self, idx: isize) -> Result<(), LuaError> {
        self.stack.insert(idx)
    }

    fn call(&mut self, n_args: usize, n_results: i32) -> Result<(), LuaError> {
        self.call_value(n_args, n_results)
    }

    fn pcall(&mut self, n_args: usize, n_results: i32, msgh: i32) -> Result<ThreadStatus, LuaError> {
        self.protected_call(n_args, n_results, msgh)
    }

    fn get_table(&mut self, table: &LuaValue, key: &LuaValue) -> Result<LuaValue, LuaError> {
        self.index(table, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(name: &'static str, f: NativeFunction) -> LuaValue {
        LuaValue::Function(Arc::new(Closure::native(name, f)))
    }

    fn add_two(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
        match (api.get(1), api.get(2)) {
            (LuaValue::Integer(a), LuaValue::Integer(b)) => {
                api.push(LuaValue::Integer(a + b));
                Ok(1)
            }
            _ => Err(LuaError::Runtime("integers expected".into())),
        }
    }

    fn three_values(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
        for i in 1..=3 {
            api.push(LuaValue::Integer(i));
        }
        Ok(3)
    }

    #[test]
    fn native_call_replaces_callee_and_args_with_results() {
        let mut l = LuaState::new();
        l.push(native("add", add_two));
        l.push(LuaValue::Integer(2));
        l.push(LuaValue::Integer(3));
        l.call(2, 1).unwrap();
        assert_eq!(l.get_top(), 1);
        assert_eq!(l.get(-1), LuaValue::Integer(5));
        assert_eq!(l.depth(), 1);
    }

    #[test]
    fn result_count_is_authoritative() {
        let mut l = LuaState::new();
        l.push(native("three", three_values));
        l.call(0, 5).unwrap();
        assert_eq!(l.get_top(), 5);
        assert_eq!(l.get(5), LuaValue::Nil);

        l.set_top(0).unwrap();
        l.push(native("three", three_values));
        l.call(0, 1).unwrap();
        assert_eq!(l.args(), vec![LuaValue::Integer(1)]);

        l.set_top(0).unwrap();
        l.push(native("three", three_values));
        l.call(0, MULTRET).unwrap();
        assert_eq!(l.get_top(), 3);
    }

    #[test]
    fn calling_a_non_function_fails() {
        let mut l = LuaState::new();
        l.push(LuaValue::Integer(1));
        assert_eq!(l.call(0, 0), Err(LuaError::NotCallable("number")));
    }

    #[test]
    fn pcall_on_non_callable_keeps_depth_and_leaves_one_value() {
        let mut l = LuaState::new();
        l.push(LuaValue::from("below"));
        l.push(LuaValue::Nil);
        l.push(LuaValue::Integer(1));
        let status = l.pcall(1, 1, 0).unwrap();
        assert_eq!(status, ThreadStatus::ErrRun);
        assert_eq!(l.depth(), 1);
        assert_eq!(l.get_top(), 2);
        assert_eq!(l.get(-1), LuaValue::from("attempt to call a nil value"));
    }

    #[test]
    fn pcall_with_negative_handler_reraises() {
        let mut l = LuaState::new();
        l.push(LuaValue::Boolean(true));
        let err = l.pcall(0, 0, -1).unwrap_err();
        assert_eq!(
            err,
            LuaError::Value(LuaValue::from("attempt to call a boolean value"))
        );
    }

    #[test]
    fn pcall_with_positive_handler_is_unsupported() {
        let mut l = LuaState::new();
        l.push(native("add", add_two));
        assert!(matches!(l.pcall(0, 0, 1), Err(LuaError::Unsupported(_))));
        assert_eq!(l.get_top(), 1);
    }

    #[test]
    fn continuation_entry_points_are_unsupported() {
        let mut l = LuaState::new();
        assert!(matches!(l.dump(), Err(LuaError::Unsupported(_))));
        assert!(matches!(l.call_k(0, 0, 0, add_two), Err(LuaError::Unsupported(_))));
        assert!(matches!(l.pcall_k(0, 0, 0, 0, add_two), Err(LuaError::Unsupported(_))));
    }

    #[test]
    fn error_objects() {
        let t = LuaTable::new().into_ref();
        t.write().set("_ERR".into(), "boom".into()).unwrap();
        assert_eq!(error_object(LuaError::Value(LuaValue::Table(t))), "boom".into());
        assert_eq!(error_object(LuaError::Value("msg".into())), "msg".into());
        assert_eq!(
            error_object(LuaError::Value(LuaValue::Integer(3))),
            "unknown error".into()
        );
        assert_eq!(error_object(LuaError::StackOverflow), "stack overflow".into());
        assert_eq!(
            error_object(LuaError::Value(LuaValue::new_table())),
            "unknown error".into()
        );
    }

    #[test]
    fn call_metamethod_receives_the_original_value() {
        fn first_arg_type(api: &mut dyn LuaApi) -> Result<usize, LuaError> {
            let ty = api.get(1).type_name();
            api.push(ty.into());
            Ok(1)
        }
        let mut l = LuaState::new();
        let mt = LuaTable::new().into_ref();
        mt.write().set("__call".into(), native("f", first_arg_type)).unwrap();
        let obj = LuaTable::new().into_ref();
        obj.write().set_metatable(Some(mt));
        l.push(LuaValue::Table(obj));
        l.call(0, 1).unwrap();
        assert_eq!(l.get(-1), LuaValue::from("table"));
    }

    #[test]
    fn registered_functions_are_globals() {
        let mut l = LuaState::new();
        l.register("add", add_two).unwrap();
        assert!(matches!(l.get_global("add"), LuaValue::Function(_)));
        assert!(matches!(l.get_global("print"), LuaValue::Function(_)));
    }
}
