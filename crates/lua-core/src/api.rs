//! The host-facing stack API.
//!
//! Native functions receive a `&mut dyn LuaApi` whose stack holds exactly
//! their arguments (index 1 = first argument) and return how many values they
//! left on top of it as results.

use crate::error::LuaError;
use crate::value::LuaValue;

/// Signature of a host callback.
pub type NativeFunction = fn(&mut dyn LuaApi) -> Result<usize, LuaError>;

/// `n_results` value requesting every result the callee produces.
pub const MULTRET: i32 = -1;

/// Outcome of a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Ok,
    /// The call raised an error; its converted value is on the stack.
    ErrRun,
}

/// Stack operations over the current call frame.
///
/// Positive indices count from the frame bottom (1-based); negative indices
/// count from the top (`-1` is the topmost value).
pub trait LuaApi {
    fn get_top(&self) -> usize;

    /// Value at `idx`, or `nil` when `idx` is outside the stack.
    fn get(&self, idx: isize) -> LuaValue;

    fn push(&mut self, value: LuaValue);

    /// Remove and return the topmost value (`nil` on an empty stack).
    fn pop(&mut self) -> LuaValue;

    /// Grow (nil-filling) or shrink the stack to `idx`.
    fn set_top(&mut self, idx: isize) -> Result<(), LuaError>;

    /// Move the top value into `idx`, shifting values above it up.
    fn insert(&mut self, idx: isize) -> Result<(), LuaError>;

    /// Call the function sitting below `n_args` arguments; leaves `n_results`
    /// values (or all of them for [`MULTRET`]) in their place.
    fn call(&mut self, n_args: usize, n_results: i32) -> Result<(), LuaError>;

    /// Like [`LuaApi::call`], but errors are caught: the callee and its
    /// arguments are replaced by the single error value and
    /// [`ThreadStatus::ErrRun`] is returned. A negative `msgh` re-raises the
    /// converted error instead.
    fn pcall(&mut self, n_args: usize, n_results: i32, msgh: i32)
        -> Result<ThreadStatus, LuaError>;

    /// `table[key]`, honouring `__index` (`lua_gettable`).
    fn get_table(&mut self, table: &LuaValue, key: &LuaValue) -> Result<LuaValue, LuaError>;

    /// All values currently on the stack, bottom first.
    fn args(&self) -> Vec<LuaValue> {
        (1..=self.get_top() as isize).map(|i| self.get(i)).collect()
    }
}
