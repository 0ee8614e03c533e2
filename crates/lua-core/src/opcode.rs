//! Lua 5.3 instruction set and its 32-bit encoding.
//!
//! ```text
//!  31       23       14        6      0
//!  |   B:9   |   C:9  |   A:8  | op:6 |   iABC
//!  |      Bx:18       |   A:8  | op:6 |   iABx / iAsBx
//!  |          Ax:26            | op:6 |   iAx
//! ```

use std::fmt;

// ── Field layout ──────────────────────────────────────────────────────────────

const SIZE_OP: u32 = 6;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 9;
const SIZE_C: u32 = 9;
const SIZE_BX: u32 = SIZE_B + SIZE_C;
const SIZE_AX: u32 = SIZE_A + SIZE_B + SIZE_C;

const POS_A: u32 = SIZE_OP;
const POS_C: u32 = POS_A + SIZE_A;
const POS_B: u32 = POS_C + SIZE_C;
const POS_BX: u32 = POS_C;
const POS_AX: u32 = POS_A;

pub const MAXARG_A: u32 = (1 << SIZE_A) - 1;
pub const MAXARG_B: u32 = (1 << SIZE_B) - 1;
pub const MAXARG_C: u32 = (1 << SIZE_C) - 1;
pub const MAXARG_BX: u32 = (1 << SIZE_BX) - 1;
pub const MAXARG_SBX: i32 = (MAXARG_BX >> 1) as i32;
pub const MAXARG_AX: u32 = (1 << SIZE_AX) - 1;

/// Bit that marks a B/C operand as a constant-pool index rather than a register.
pub const BITRK: u32 = 1 << (SIZE_B - 1);
/// Largest constant index that still fits in an RK operand.
pub const MAXINDEXRK: u32 = BITRK - 1;

/// Number of list items buffered before a `SETLIST` flush.
pub const LFIELDS_PER_FLUSH: usize = 50;

/// Encode constant index `idx` as an RK operand.
pub fn rk_const(idx: u32) -> u32 {
    idx | BITRK
}

/// Does the RK operand `x` refer to the constant pool?
pub fn is_k(x: u32) -> bool {
    x & BITRK != 0
}

/// Constant index carried by an RK operand.
pub fn index_k(x: u32) -> u32 {
    x & !BITRK
}

// ── Opcodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move,
    LoadK,
    LoadKx,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    SelfOp,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    VarArg,
    ExtraArg,
}

/// Instruction format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    ABC,
    ABx,
    AsBx,
    Ax,
}

/// How an instruction uses its B or C operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpArg {
    /// Not used.
    N,
    /// Used as a plain number.
    U,
    /// A register or a jump offset.
    R,
    /// A constant or a register (RK).
    K,
}

struct OpInfo {
    name: &'static str,
    mode: OpMode,
    b: OpArg,
    c: OpArg,
}

const fn info(name: &'static str, mode: OpMode, b: OpArg, c: OpArg) -> OpInfo {
    OpInfo { name, mode, b, c }
}

use OpArg::{K, N, R, U};
use OpMode::{ABx, AsBx, Ax, ABC};

static OP_INFO: [OpInfo; 47] = [
    info("move", ABC, R, N),
    info("loadk", ABx, K, N),
    info("loadkx", ABx, N, N),
    info("loadbool", ABC, U, U),
    info("loadnil", ABC, U, N),
    info("getupval", ABC, U, N),
    info("gettabup", ABC, U, K),
    info("gettable", ABC, R, K),
    info("settabup", ABC, K, K),
    info("setupval", ABC, U, N),
    info("settable", ABC, K, K),
    info("newtable", ABC, U, U),
    info("self", ABC, R, K),
    info("add", ABC, K, K),
    info("sub", ABC, K, K),
    info("mul", ABC, K, K),
    info("mod", ABC, K, K),
    info("pow", ABC, K, K),
    info("div", ABC, K, K),
    info("idiv", ABC, K, K),
    info("band", ABC, K, K),
    info("bor", ABC, K, K),
    info("bxor", ABC, K, K),
    info("shl", ABC, K, K),
    info("shr", ABC, K, K),
    info("unm", ABC, R, N),
    info("bnot", ABC, R, N),
    info("not", ABC, R, N),
    info("len", ABC, R, N),
    info("concat", ABC, R, R),
    info("jmp", AsBx, R, N),
    info("eq", ABC, K, K),
    info("lt", ABC, K, K),
    info("le", ABC, K, K),
    info("test", ABC, N, U),
    info("testset", ABC, R, U),
    info("call", ABC, U, U),
    info("tailcall", ABC, U, U),
    info("return", ABC, U, N),
    info("forloop", AsBx, R, N),
    info("forprep", AsBx, R, N),
    info("tforcall", ABC, N, U),
    info("tforloop", AsBx, R, N),
    info("setlist", ABC, U, U),
    info("closure", ABx, U, N),
    info("vararg", ABC, U, N),
    info("extraarg", Ax, U, U),
];

impl OpCode {
    /// Every opcode, indexed by its numeric value.
    pub const ALL: [OpCode; 47] = [
        OpCode::Move,
        OpCode::LoadK,
        OpCode::LoadKx,
        OpCode::LoadBool,
        OpCode::LoadNil,
        OpCode::GetUpval,
        OpCode::GetTabUp,
        OpCode::GetTable,
        OpCode::SetTabUp,
        OpCode::SetUpval,
        OpCode::SetTable,
        OpCode::NewTable,
        OpCode::SelfOp,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Mod,
        OpCode::Pow,
        OpCode::Div,
        OpCode::IDiv,
        OpCode::BAnd,
        OpCode::BOr,
        OpCode::BXor,
        OpCode::Shl,
        OpCode::Shr,
        OpCode::Unm,
        OpCode::BNot,
        OpCode::Not,
        OpCode::Len,
        OpCode::Concat,
        OpCode::Jmp,
        OpCode::Eq,
        OpCode::Lt,
        OpCode::Le,
        OpCode::Test,
        OpCode::TestSet,
        OpCode::Call,
        OpCode::TailCall,
        OpCode::Return,
        OpCode::ForLoop,
        OpCode::ForPrep,
        OpCode::TForCall,
        OpCode::TForLoop,
        OpCode::SetList,
        OpCode::Closure,
        OpCode::VarArg,
        OpCode::ExtraArg,
    ];

    fn info(self) -> &'static OpInfo {
        &OP_INFO[self as usize]
    }

    /// Lower-case mnemonic, as printed by the disassembler.
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn mode(self) -> OpMode {
        self.info().mode
    }

    pub fn b_mode(self) -> OpArg {
        self.info().b
    }

    pub fn c_mode(self) -> OpArg {
        self.info().c
    }
}

// ── Encoded instruction ───────────────────────────────────────────────────────

/// One encoded instruction word.
///
/// Only the typed constructors can build an `Instruction`, so the opcode field
/// always holds a valid [`OpCode`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(u32);

impl Instruction {
    pub fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        debug_assert!(a <= MAXARG_A && b <= MAXARG_B && c <= MAXARG_C);
        Self(op as u32 | (a << POS_A) | (b << POS_B) | (c << POS_C))
    }

    pub fn abx(op: OpCode, a: u32, bx: u32) -> Self {
        debug_assert!(a <= MAXARG_A && bx <= MAXARG_BX);
        Self(op as u32 | (a << POS_A) | (bx << POS_BX))
    }

    pub fn asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        Self::abx(op, a, (sbx + MAXARG_SBX) as u32)
    }

    pub fn ax(op: OpCode, ax: u32) -> Self {
        debug_assert!(ax <= MAXARG_AX);
        Self(op as u32 | (ax << POS_AX))
    }

    /// The raw 32-bit word.
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn opcode(self) -> OpCode {
        OpCode::ALL[(self.0 & ((1 << SIZE_OP) - 1)) as usize]
    }

    pub fn a(self) -> u32 {
        (self.0 >> POS_A) & MAXARG_A
    }

    pub fn b(self) -> u32 {
        (self.0 >> POS_B) & MAXARG_B
    }

    pub fn c(self) -> u32 {
        (self.0 >> POS_C) & MAXARG_C
    }

    pub fn bx(self) -> u32 {
        (self.0 >> POS_BX) & MAXARG_BX
    }

    pub fn sbx(self) -> i32 {
        self.bx() as i32 - MAXARG_SBX
    }

    pub fn ax_arg(self) -> u32 {
        (self.0 >> POS_AX) & MAXARG_AX
    }

    pub fn set_a(&mut self, a: u32) {
        debug_assert!(a <= MAXARG_A);
        self.0 = (self.0 & !(MAXARG_A << POS_A)) | (a << POS_A);
    }

    pub fn set_sbx(&mut self, sbx: i32) {
        let bx = (sbx + MAXARG_SBX) as u32;
        debug_assert!(bx <= MAXARG_BX);
        self.0 = (self.0 & !(MAXARG_BX << POS_BX)) | (bx << POS_BX);
    }

    /// Is this an instruction whose sBx field is a jump displacement?
    pub fn is_jump(self) -> bool {
        matches!(
            self.opcode(),
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep | OpCode::TForLoop
        )
    }
}

fn fmt_operand(f: &mut fmt::Formatter<'_>, mode: OpArg, x: u32) -> fmt::Result {
    match mode {
        OpArg::N => write!(f, "_"),
        OpArg::K if is_k(x) => write!(f, "{}", -1 - index_k(x) as i64),
        _ => write!(f, "{x}"),
    }
}

/// Compact `name(a,b,c)` form; unused operands print as `_`,
/// constants as `-1 - index`.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        write!(f, "{}(", op.name())?;
        match op.mode() {
            OpMode::ABC => {
                write!(f, "{},", self.a())?;
                fmt_operand(f, op.b_mode(), self.b())?;
                write!(f, ",")?;
                fmt_operand(f, op.c_mode(), self.c())?;
            }
            OpMode::ABx => {
                write!(f, "{},", self.a())?;
                match op.b_mode() {
                    OpArg::K => write!(f, "{}", -1 - self.bx() as i64)?,
                    OpArg::N => write!(f, "_")?,
                    _ => write!(f, "{}", self.bx())?,
                }
            }
            OpMode::AsBx => write!(f, "{},{}", self.a(), self.sbx())?,
            OpMode::Ax => write!(f, "{}", -1 - self.ax_arg() as i64)?,
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction({self} = {:#010x})", self.0)
    }
}

// ── "Floating point byte" size hints ─────────────────────────────────────────

/// Encode `x` as `eeeeexxx`, meaning `(1xxx) * 2^(eeeee - 1)` when
/// `eeeee != 0` and `xxx` otherwise. Rounds up.
pub fn int2fb(mut x: u32) -> u32 {
    let mut e = 0;
    if x < 8 {
        return x;
    }
    while x >= (8 << 4) {
        x = (x + 0xf) >> 4;
        e += 4;
    }
    while x >= (8 << 1) {
        x = (x + 1) >> 1;
        e += 1;
    }
    ((e + 1) << 3) | (x - 8)
}

pub fn fb2int(x: u32) -> u32 {
    if x < 8 {
        x
    } else {
        ((x & 7) + 8) << ((x >> 3) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abc_fields_round_trip_through_the_word() {
        let i = Instruction::abc(OpCode::Call, 3, 2, 1);
        assert_eq!(i.opcode(), OpCode::Call);
        assert_eq!((i.a(), i.b(), i.c()), (3, 2, 1));
    }

    #[test]
    fn sbx_is_signed() {
        let mut i = Instruction::asbx(OpCode::Jmp, 0, -6);
        assert_eq!(i.sbx(), -6);
        i.set_sbx(MAXARG_SBX);
        assert_eq!(i.sbx(), MAXARG_SBX);
        i.set_a(4);
        assert_eq!(i.a(), 4);
        assert_eq!(i.sbx(), MAXARG_SBX);
    }

    #[test]
    fn display_matches_listing_format() {
        let k = rk_const(0);
        assert_eq!(
            Instruction::abc(OpCode::GetTabUp, 0, 0, k).to_string(),
            "gettabup(0,0,-1)"
        );
        assert_eq!(Instruction::abc(OpCode::Move, 6, 3, 0).to_string(), "move(6,3,_)");
        assert_eq!(Instruction::abc(OpCode::Test, 0, 0, 0).to_string(), "test(0,_,0)");
        assert_eq!(Instruction::abx(OpCode::LoadK, 1, 2).to_string(), "loadk(1,-3)");
        assert_eq!(Instruction::asbx(OpCode::ForLoop, 0, -3).to_string(), "forloop(0,-3)");
        assert_eq!(
            Instruction::abc(OpCode::SetTable, 1, 2, 3).to_string(),
            "settable(1,2,3)"
        );
    }

    #[test]
    fn opcode_table_is_ordered() {
        for (i, op) in OpCode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i);
        }
        assert_eq!(OpCode::ExtraArg.name(), "extraarg");
        assert_eq!(OpCode::Jmp.mode(), OpMode::AsBx);
    }

    #[test]
    fn floating_point_bytes() {
        for x in 0..8 {
            assert_eq!(int2fb(x), x);
        }
        assert_eq!(fb2int(int2fb(48)), 48);
        assert!(fb2int(int2fb(50)) >= 50);
        assert!(fb2int(int2fb(1000)) >= 1000);
    }
}
