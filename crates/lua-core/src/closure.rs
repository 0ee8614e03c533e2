//! Function prototype and closure types.

use crate::api::NativeFunction;
use crate::opcode::Instruction;
use crate::value::LuaValue;
use parking_lot::RwLock;
use std::sync::Arc;

// ── Function prototype ────────────────────────────────────────────────────────

/// A compiled function prototype, immutable after compilation.
///
/// Every Lua function (top-level chunk or nested lambda) compiles to a `Proto`.
/// Closures share a `Proto` via `Arc`; upvalue cells are per-instance.
#[derive(Debug, Default)]
pub struct Proto {
    /// Encoded instructions.
    pub code: Vec<Instruction>,
    /// Source line of each instruction (parallel to `code`).
    pub line_info: Vec<u32>,
    /// Constant pool; no two entries are equal.
    pub constants: Vec<LuaValue>,
    /// How to obtain each upvalue when the closure is instantiated.
    pub upvalues: Vec<UpvalueDesc>,
    /// Debug: upvalue names (parallel to `upvalues`).
    pub upvalue_names: Vec<String>,
    /// Nested function prototypes referenced by `CLOSURE`.
    pub protos: Vec<Arc<Proto>>,
    /// Number of fixed parameters.
    pub num_params: u8,
    /// Whether the function accepts varargs (`...`).
    pub is_vararg: bool,
    /// Register high-water mark; never below 2.
    pub max_stack_size: u8,
    /// Debug: local variable lifetimes.
    pub loc_vars: Vec<LocVar>,
    /// Debug: source name.
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

/// A local variable's name and the pc range in which it is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocVar {
    pub name: String,
    pub start_pc: usize,
    pub end_pc: usize,
}

// ── Upvalue descriptors ───────────────────────────────────────────────────────

/// Describes where to find an upvalue at closure instantiation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueDesc {
    /// Capture the local at register `reg` in the **immediately enclosing** call frame.
    Stack(u8),
    /// Re-use upvalue at index `idx` from the **enclosing** closure.
    Upvalue(u8),
}

// ── Upvalue cells ─────────────────────────────────────────────────────────────

/// A shared, mutable upvalue cell.
///
/// While the captured local is still on the stack (`Open`), the cell names the
/// frame and slot that hold it. When that frame is torn down (or the block
/// exits), the runtime copies the value into the cell (`Closed`).
#[derive(Debug, Clone)]
pub struct Upvalue(pub Arc<RwLock<UpvalueInner>>);

impl Upvalue {
    /// Create an open upvalue pointing at `slot` of call frame `frame`.
    pub fn open(frame: usize, slot: usize) -> Self {
        Self(Arc::new(RwLock::new(UpvalueInner::Open { frame, slot })))
    }

    /// Create a closed (heap-allocated) upvalue with the given initial value.
    pub fn closed(val: LuaValue) -> Self {
        Self(Arc::new(RwLock::new(UpvalueInner::Closed(val))))
    }

    /// Migrate the value out of its frame.
    pub fn close(&self, val: LuaValue) {
        *self.0.write() = UpvalueInner::Closed(val);
    }

    pub fn ptr_eq(&self, other: &Upvalue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Interior state of an upvalue cell.
#[derive(Debug, Clone)]
pub enum UpvalueInner {
    /// The value is still alive in register `slot` of frame `frame`.
    Open { frame: usize, slot: usize },
    /// The enclosing frame exited; the value was migrated here.
    Closed(LuaValue),
}

// ── Closures ──────────────────────────────────────────────────────────────────

/// A callable value: compiled Lua code or a host callback.
#[derive(Debug)]
pub enum Closure {
    Lua(LuaClosure),
    Native(NativeClosure),
}

impl Closure {
    pub fn lua(proto: Arc<Proto>, upvalues: Vec<Upvalue>) -> Self {
        Closure::Lua(LuaClosure::new(proto, upvalues))
    }

    pub fn native(name: &'static str, func: NativeFunction) -> Self {
        Closure::Native(NativeClosure { name, func })
    }
}

/// A runtime closure: a `Proto` paired with its captured upvalue cells.
#[derive(Debug)]
pub struct LuaClosure {
    /// The compiled function body.
    pub proto: Arc<Proto>,
    /// Upvalue cells, one per `proto.upvalues` entry.
    pub upvalues: Vec<Upvalue>,
}

impl LuaClosure {
    pub fn new(proto: Arc<Proto>, upvalues: Vec<Upvalue>) -> Self {
        Self { proto, upvalues }
    }
}

/// A host function registered with the engine.
pub struct NativeClosure {
    pub name: &'static str,
    pub func: NativeFunction,
}

impl std::fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeClosure({})", self.name)
    }
}
