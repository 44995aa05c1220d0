// bog-vm - Bytecode compiler and virtual machine for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Bytecode instruction definitions and operand encoding.
//!
//! An instruction is a one-byte opcode followed by operands whose widths
//! depend on the opcode: register references are one byte, string references
//! and forward jump offsets are `u32`, relative jumps are `i32`, argument
//! counts are `u16`, type ids one byte. Multi-byte operands are little-endian
//! and are encoded and decoded explicitly — never through memory layout.

/// Bytecode instructions for the Bog VM.
///
/// Register operands are unsigned indexes relative to the current frame's
/// stack pointer. `A` is the destination register unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // =========================================================================
    // Constants
    // =========================================================================
    /// A = i8 operand as int.
    ConstInt8 = 0,
    /// A = i32 operand as int.
    ConstInt32 = 1,
    /// A = i64 operand as int.
    ConstInt64 = 2,
    /// A = f64 operand as num.
    ConstNum = 3,
    /// A = none/false/true for operand 0/1/2.
    ConstPrimitive = 4,
    /// A = string at strref operand.
    ConstString = 5,

    // =========================================================================
    // Arithmetic; int operands promote to num when either side is num
    // =========================================================================
    Add = 6,
    Sub = 7,
    Mul = 8,
    Pow = 9,
    /// Floored division; always yields int.
    DivFloor = 10,
    /// Division; always yields num.
    Div = 11,
    Mod = 12,

    // =========================================================================
    // Bitwise (int only)
    // =========================================================================
    BitNot = 13,
    BitAnd = 14,
    BitOr = 15,
    BitXor = 16,

    // =========================================================================
    // Boolean (bool only)
    // =========================================================================
    BoolNot = 17,
    BoolAnd = 18,
    BoolOr = 19,

    // =========================================================================
    // Shifts; shifting by 64 or more yields 0, negative amounts error
    // =========================================================================
    LShift = 20,
    RShift = 21,

    // =========================================================================
    // Comparison
    // =========================================================================
    Equal = 22,
    NotEqual = 23,
    LessThan = 24,
    LessThanEqual = 25,
    GreaterThan = 26,
    GreaterThanEqual = 27,
    In = 28,

    // =========================================================================
    // Moves
    // =========================================================================
    /// A = B; both registers alias the same value afterwards.
    Move = 29,
    /// A = shallow copy of B.
    Copy = 30,

    /// A = -B.
    Negate = 31,

    /// If B is not an err, A = B; otherwise return the err from the current
    /// frame (at module depth it becomes the module result).
    Try = 32,

    // =========================================================================
    // Jumps; offsets are relative to the ip after operand decode
    // =========================================================================
    /// Unconditional, signed offset.
    Jump = 33,
    /// Forward if A is true.
    JumpTrue = 34,
    /// Forward if A is false.
    JumpFalse = 35,
    /// Forward if A is none.
    JumpNone = 36,
    /// Forward if A is not an err.
    JumpNotError = 37,

    // =========================================================================
    // Iteration
    // =========================================================================
    /// A = new iterator over B.
    IterInit = 38,
    /// Advance iterator B; A = next element or none at exhaustion.
    IterNext = 39,

    // =========================================================================
    // Error values
    // =========================================================================
    /// A = err(B).
    BuildError = 40,
    /// A = the value wrapped by err B; fails if B is not an err.
    UnwrapError = 41,

    // =========================================================================
    // Imports and natives
    // =========================================================================
    /// A = result of importing the module named by the strref operand.
    Import = 42,
    /// A = registered native named by the strref operand.
    BuildNative = 43,

    // =========================================================================
    // Aggregates; operands: A, base register, u16 count
    // =========================================================================
    BuildTuple = 44,
    BuildList = 45,
    /// Count is even: slots come in key, value pairs.
    BuildMap = 46,

    /// A = function; operands: u8 arg count, u8 capture count, u32 entry.
    /// Captures start out unset and are filled by `StoreCapture`.
    BuildFn = 47,

    // =========================================================================
    // Captures
    // =========================================================================
    /// A = current function's capture n (u8 operand).
    LoadCapture = 48,
    /// Operands: target function register, value register, u8 n.
    StoreCapture = 49,

    // =========================================================================
    // Member access
    // =========================================================================
    /// A = B[C]; records B as the `this` candidate for an immediately
    /// following `Call`.
    Get = 50,
    /// A[B] = C.
    Set = 51,

    // =========================================================================
    // Type tests and conversions; u8 type id operand
    // =========================================================================
    As = 52,
    Is = 53,

    // =========================================================================
    // Calls and returns
    // =========================================================================
    /// Operands: return register, function register, argument base register,
    /// u16 argument count.
    Call = 54,
    /// Return A from the current frame.
    Return = 55,
    /// Return none from the current frame.
    ReturnNone = 56,

    // =========================================================================
    // Frame context
    // =========================================================================
    /// A = the current frame's `this`; errors if unset.
    LoadThis = 57,
    /// Ignore A. An err value is a runtime error, except at module depth
    /// where it becomes the module result; in REPL mode at module depth any
    /// value is returned.
    Discard = 58,
    /// Update the current source offset (u32 operand) for diagnostics.
    LineInfo = 59,

    /// A = range with start B and end C (both int), step 1.
    BuildRange = 60,
}

impl Op {
    /// Decode an opcode byte. Unknown bytes are malformed bytecode.
    pub fn from_byte(byte: u8) -> Option<Op> {
        Some(match byte {
            0 => Op::ConstInt8,
            1 => Op::ConstInt32,
            2 => Op::ConstInt64,
            3 => Op::ConstNum,
            4 => Op::ConstPrimitive,
            5 => Op::ConstString,
            6 => Op::Add,
            7 => Op::Sub,
            8 => Op::Mul,
            9 => Op::Pow,
            10 => Op::DivFloor,
            11 => Op::Div,
            12 => Op::Mod,
            13 => Op::BitNot,
            14 => Op::BitAnd,
            15 => Op::BitOr,
            16 => Op::BitXor,
            17 => Op::BoolNot,
            18 => Op::BoolAnd,
            19 => Op::BoolOr,
            20 => Op::LShift,
            21 => Op::RShift,
            22 => Op::Equal,
            23 => Op::NotEqual,
            24 => Op::LessThan,
            25 => Op::LessThanEqual,
            26 => Op::GreaterThan,
            27 => Op::GreaterThanEqual,
            28 => Op::In,
            29 => Op::Move,
            30 => Op::Copy,
            31 => Op::Negate,
            32 => Op::Try,
            33 => Op::Jump,
            34 => Op::JumpTrue,
            35 => Op::JumpFalse,
            36 => Op::JumpNone,
            37 => Op::JumpNotError,
            38 => Op::IterInit,
            39 => Op::IterNext,
            40 => Op::BuildError,
            41 => Op::UnwrapError,
            42 => Op::Import,
            43 => Op::BuildNative,
            44 => Op::BuildTuple,
            45 => Op::BuildList,
            46 => Op::BuildMap,
            47 => Op::BuildFn,
            48 => Op::LoadCapture,
            49 => Op::StoreCapture,
            50 => Op::Get,
            51 => Op::Set,
            52 => Op::As,
            53 => Op::Is,
            54 => Op::Call,
            55 => Op::Return,
            56 => Op::ReturnNone,
            57 => Op::LoadThis,
            58 => Op::Discard,
            59 => Op::LineInfo,
            60 => Op::BuildRange,
            _ => return None,
        })
    }
}

/// `ConstPrimitive` operand values.
pub const PRIMITIVE_NONE: u8 = 0;
pub const PRIMITIVE_FALSE: u8 = 1;
pub const PRIMITIVE_TRUE: u8 = 2;

// ============================================================================
// Encoding
// ============================================================================

/// Append-only instruction buffer used by the compiler.
#[derive(Debug, Default)]
pub struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset, used as a jump target or patch location.
    pub fn pos(&self) -> usize {
        self.bytes.len()
    }

    pub fn op(&mut self, op: Op) {
        self.bytes.push(op as u8);
    }

    pub fn u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i8(&mut self, v: i8) {
        self.bytes.push(v as u8);
    }

    pub fn i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Overwrite four bytes at `at` with a `u32` written earlier as a
    /// placeholder.
    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn patch_i32(&mut self, at: usize, v: i32) {
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Bounds-checked operand reads; `None` means malformed bytecode.

pub fn read_u8(code: &[u8], ip: &mut usize) -> Option<u8> {
    let v = *code.get(*ip)?;
    *ip += 1;
    Some(v)
}

pub fn read_u16(code: &[u8], ip: &mut usize) -> Option<u16> {
    let bytes = code.get(*ip..*ip + 2)?;
    *ip += 2;
    Some(u16::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_u32(code: &[u8], ip: &mut usize) -> Option<u32> {
    let bytes = code.get(*ip..*ip + 4)?;
    *ip += 4;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_i8(code: &[u8], ip: &mut usize) -> Option<i8> {
    read_u8(code, ip).map(|v| v as i8)
}

pub fn read_i32(code: &[u8], ip: &mut usize) -> Option<i32> {
    read_u32(code, ip).map(|v| v as i32)
}

pub fn read_i64(code: &[u8], ip: &mut usize) -> Option<i64> {
    let bytes = code.get(*ip..*ip + 8)?;
    *ip += 8;
    Some(i64::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_f64(code: &[u8], ip: &mut usize) -> Option<f64> {
    let bytes = code.get(*ip..*ip + 8)?;
    *ip += 8;
    Some(f64::from_le_bytes(bytes.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_byte_roundtrips() {
        for byte in 0..=60u8 {
            let op = Op::from_byte(byte).expect("opcode should decode");
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Op::from_byte(61), None);
        assert_eq!(Op::from_byte(255), None);
    }

    #[test]
    fn operands_are_little_endian() {
        let mut buf = CodeBuf::new();
        buf.u32(0x0403_0201);
        assert_eq!(buf.as_bytes(), &[1, 2, 3, 4]);

        let mut buf = CodeBuf::new();
        buf.i64(-2);
        let mut ip = 0;
        assert_eq!(read_i64(buf.as_bytes(), &mut ip), Some(-2));
        assert_eq!(ip, 8);
    }

    #[test]
    fn reads_are_bounds_checked() {
        let code = [1u8, 2];
        let mut ip = 1;
        assert_eq!(read_u16(&code, &mut ip), None);
        assert_eq!(read_u8(&code, &mut ip), Some(2));
        assert_eq!(read_u8(&code, &mut ip), None);
    }

    #[test]
    fn patching_overwrites_placeholders() {
        let mut buf = CodeBuf::new();
        buf.op(Op::Jump);
        let at = buf.pos();
        buf.i32(0);
        buf.op(Op::ReturnNone);
        buf.patch_i32(at, -5);
        let mut ip = 1;
        assert_eq!(read_i32(buf.as_bytes(), &mut ip), Some(-5));
    }

    #[test]
    fn f64_roundtrip() {
        let mut buf = CodeBuf::new();
        buf.f64(1.5);
        let mut ip = 0;
        assert_eq!(read_f64(buf.as_bytes(), &mut ip), Some(1.5));
    }
}
