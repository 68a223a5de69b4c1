//! Statements and opcodes

use serde::{Deserialize, Serialize};

use crate::operand::{GlobalIndex, JumpOffset};

/// Size of one encoded statement in bytes
pub const STATEMENT_SIZE: usize = 8;

/// Statement opcodes
///
/// Operands `a`, `b` and `c` are global cell indices unless noted.
/// Vector operands occupy three consecutive cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Opcode {
    // ==================== Control ====================
    /// End of function; returns `a` like `Return`
    Done = 0,

    // ==================== Float/Vector Arithmetic ====================
    /// c = a * b (floats)
    MulF = 1,
    /// c = a . b (dot product of vectors)
    MulV = 2,
    /// c = a * b (float times vector)
    MulFV = 3,
    /// c = a * b (vector times float)
    MulVF = 4,
    /// c = a / b (floats)
    DivF = 5,
    /// c = a + b (floats)
    AddF = 6,
    /// c = a + b (vectors)
    AddV = 7,
    /// c = a - b (floats)
    SubF = 8,
    /// c = a - b (vectors)
    SubV = 9,

    // ==================== Comparison ====================
    /// c = a == b (floats)
    EqF = 10,
    /// c = a == b (vectors)
    EqV = 11,
    /// c = a == b (string contents)
    EqS = 12,
    /// c = a == b (entities)
    EqE = 13,
    /// c = a == b (functions)
    EqFnc = 14,
    /// c = a != b (floats)
    NeF = 15,
    /// c = a != b (vectors)
    NeV = 16,
    /// c = a != b (string contents)
    NeS = 17,
    /// c = a != b (entities)
    NeE = 18,
    /// c = a != b (functions)
    NeFnc = 19,
    /// c = a <= b
    Le = 20,
    /// c = a >= b
    Ge = 21,
    /// c = a < b
    Lt = 22,
    /// c = a > b
    Gt = 23,

    // ==================== Field Loads ====================
    /// c = entity(a).field(b) (float)
    LoadF = 24,
    /// c = entity(a).field(b) (vector)
    LoadV = 25,
    /// c = entity(a).field(b) (string)
    LoadS = 26,
    /// c = entity(a).field(b) (entity)
    LoadEnt = 27,
    /// c = entity(a).field(b) (field)
    LoadFld = 28,
    /// c = entity(a).field(b) (function)
    LoadFnc = 29,
    /// c = &entity(a).field(b)
    Address = 30,

    // ==================== Global Stores ====================
    /// b = a (float)
    StoreF = 31,
    /// b = a (vector)
    StoreV = 32,
    /// b = a (string)
    StoreS = 33,
    /// b = a (entity)
    StoreEnt = 34,
    /// b = a (field)
    StoreFld = 35,
    /// b = a (function)
    StoreFnc = 36,

    // ==================== Pointer Stores ====================
    /// *b = a (float)
    StorePF = 37,
    /// *b = a (vector)
    StorePV = 38,
    /// *b = a (string)
    StorePS = 39,
    /// *b = a (entity)
    StorePEnt = 40,
    /// *b = a (field)
    StorePFld = 41,
    /// *b = a (function)
    StorePFnc = 42,

    /// Return `a` (up to three cells) to the caller
    Return = 43,

    // ==================== Logical Not ====================
    /// c = !a (float)
    NotF = 44,
    /// c = !a (vector)
    NotV = 45,
    /// c = !a (string: null or empty)
    NotS = 46,
    /// c = !a (entity)
    NotEnt = 47,
    /// c = !a (function)
    NotFnc = 48,

    // ==================== Branches ====================
    /// if a: jump by b
    If = 49,
    /// if !a: jump by b
    IfNot = 50,

    // ==================== Calls ====================
    /// Call function `a` with no arguments
    Call0 = 51,
    /// Call function `a` with 1 argument
    Call1 = 52,
    /// Call function `a` with 2 arguments
    Call2 = 53,
    /// Call function `a` with 3 arguments
    Call3 = 54,
    /// Call function `a` with 4 arguments
    Call4 = 55,
    /// Call function `a` with 5 arguments
    Call5 = 56,
    /// Call function `a` with 6 arguments
    Call6 = 57,
    /// Call function `a` with 7 arguments
    Call7 = 58,
    /// Call function `a` with 8 arguments
    Call8 = 59,

    /// self.frame = a; self.think = b; self.nextthink = time + interval
    State = 60,
    /// Jump by a
    Goto = 61,

    // ==================== Float Logic ====================
    /// c = a && b
    And = 62,
    /// c = a || b
    Or = 63,
    /// c = (int)a & (int)b, as float
    BitAnd = 64,
    /// c = (int)a | (int)b, as float
    BitOr = 65,

    // ==================== Integer Extensions ====================
    /// c = a + b (integers, wrapping)
    AddI = 66,
    /// c = a - b (integers, wrapping)
    SubI = 67,
    /// c = a * b (integers, wrapping)
    MulI = 68,
    /// c = a / b (integers)
    DivI = 69,
    /// c = a % b (integers)
    ModI = 70,
    /// c = a & b (integers)
    BitAndI = 71,
    /// c = a | b (integers)
    BitOrI = 72,
    /// c = a ^ b (integers)
    BitXorI = 73,
    /// c = a << b (integers)
    LShiftI = 74,
    /// c = a >> b (integers, arithmetic)
    RShiftI = 75,
    /// c = a == b (integers)
    EqI = 76,
    /// c = a != b (integers)
    NeI = 77,
    /// c = a < b (integers)
    LtI = 78,
    /// c = a <= b (integers)
    LeI = 79,
    /// c = a > b (integers)
    GtI = 80,
    /// c = a >= b (integers)
    GeI = 81,
    /// c = !a (integer)
    NotI = 82,
    /// c = (float)a
    ConvIToF = 83,
    /// c = (int)a, truncating
    ConvFToI = 84,
    /// c = entity(a).field(b) (integer)
    LoadI = 85,
    /// b = a (integer)
    StoreI = 86,
    /// *b = a (integer)
    StorePI = 87,

    // ==================== Global Addressing ====================
    /// c = &a (pointer to a global cell)
    GlobalAddress = 88,
    /// c = *a (float)
    LoadPF = 89,
    /// c = *a (vector)
    LoadPV = 90,
    /// c = *a (integer)
    LoadPI = 91,
}

/// How a statement interprets one of its operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Operand is ignored
    Unused,
    /// One global cell
    Global,
    /// Three consecutive global cells
    Vector,
    /// Relative jump offset
    Jump,
}

impl Opcode {
    /// Convert from the raw statement encoding
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Self::Done,
            1 => Self::MulF,
            2 => Self::MulV,
            3 => Self::MulFV,
            4 => Self::MulVF,
            5 => Self::DivF,
            6 => Self::AddF,
            7 => Self::AddV,
            8 => Self::SubF,
            9 => Self::SubV,

            10 => Self::EqF,
            11 => Self::EqV,
            12 => Self::EqS,
            13 => Self::EqE,
            14 => Self::EqFnc,
            15 => Self::NeF,
            16 => Self::NeV,
            17 => Self::NeS,
            18 => Self::NeE,
            19 => Self::NeFnc,
            20 => Self::Le,
            21 => Self::Ge,
            22 => Self::Lt,
            23 => Self::Gt,

            24 => Self::LoadF,
            25 => Self::LoadV,
            26 => Self::LoadS,
            27 => Self::LoadEnt,
            28 => Self::LoadFld,
            29 => Self::LoadFnc,
            30 => Self::Address,

            31 => Self::StoreF,
            32 => Self::StoreV,
            33 => Self::StoreS,
            34 => Self::StoreEnt,
            35 => Self::StoreFld,
            36 => Self::StoreFnc,

            37 => Self::StorePF,
            38 => Self::StorePV,
            39 => Self::StorePS,
            40 => Self::StorePEnt,
            41 => Self::StorePFld,
            42 => Self::StorePFnc,

            43 => Self::Return,

            44 => Self::NotF,
            45 => Self::NotV,
            46 => Self::NotS,
            47 => Self::NotEnt,
            48 => Self::NotFnc,

            49 => Self::If,
            50 => Self::IfNot,

            51 => Self::Call0,
            52 => Self::Call1,
            53 => Self::Call2,
            54 => Self::Call3,
            55 => Self::Call4,
            56 => Self::Call5,
            57 => Self::Call6,
            58 => Self::Call7,
            59 => Self::Call8,

            60 => Self::State,
            61 => Self::Goto,

            62 => Self::And,
            63 => Self::Or,
            64 => Self::BitAnd,
            65 => Self::BitOr,

            66 => Self::AddI,
            67 => Self::SubI,
            68 => Self::MulI,
            69 => Self::DivI,
            70 => Self::ModI,
            71 => Self::BitAndI,
            72 => Self::BitOrI,
            73 => Self::BitXorI,
            74 => Self::LShiftI,
            75 => Self::RShiftI,
            76 => Self::EqI,
            77 => Self::NeI,
            78 => Self::LtI,
            79 => Self::LeI,
            80 => Self::GtI,
            81 => Self::GeI,
            82 => Self::NotI,
            83 => Self::ConvIToF,
            84 => Self::ConvFToI,
            85 => Self::LoadI,
            86 => Self::StoreI,
            87 => Self::StorePI,

            88 => Self::GlobalAddress,
            89 => Self::LoadPF,
            90 => Self::LoadPV,
            91 => Self::LoadPI,

            _ => return None,
        })
    }

    /// Raw statement encoding
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Argument count of a `CallN` opcode
    pub fn call_argc(self) -> Option<usize> {
        let raw = self.to_u16();
        if (Self::Call0 as u16..=Self::Call8 as u16).contains(&raw) {
            Some((raw - Self::Call0 as u16) as usize)
        } else {
            None
        }
    }

    /// `CallN` opcode for `argc` arguments
    pub fn call(argc: usize) -> Option<Self> {
        if argc > crate::MAX_PARMS {
            return None;
        }
        Self::from_u16(Self::Call0 as u16 + argc as u16)
    }

    /// How each of the three operands is interpreted
    pub const fn operand_kinds(self) -> [OperandKind; 3] {
        use OperandKind::{Global as G, Jump as J, Unused as U, Vector as V};
        match self {
            // Return copies up to three cells; the tail is clamped at run time
            Self::Done | Self::Return => [G, U, U],

            Self::MulV | Self::EqV | Self::NeV => [V, V, G],
            Self::MulFV => [G, V, V],
            Self::MulVF => [V, G, V],
            Self::AddV | Self::SubV => [V, V, V],

            Self::LoadV => [G, G, V],

            Self::StoreV => [V, V, U],
            Self::StoreF
            | Self::StoreS
            | Self::StoreEnt
            | Self::StoreFld
            | Self::StoreFnc
            | Self::StoreI => [G, G, U],

            Self::StorePV => [V, G, U],
            Self::StorePF
            | Self::StorePS
            | Self::StorePEnt
            | Self::StorePFld
            | Self::StorePFnc
            | Self::StorePI => [G, G, U],

            Self::NotV => [V, U, G],
            Self::NotF
            | Self::NotS
            | Self::NotEnt
            | Self::NotFnc
            | Self::NotI
            | Self::ConvIToF
            | Self::ConvFToI
            | Self::GlobalAddress
            | Self::LoadPF
            | Self::LoadPI => [G, U, G],
            Self::LoadPV => [G, U, V],

            Self::If | Self::IfNot => [G, J, U],
            Self::Goto => [J, U, U],

            Self::Call0
            | Self::Call1
            | Self::Call2
            | Self::Call3
            | Self::Call4
            | Self::Call5
            | Self::Call6
            | Self::Call7
            | Self::Call8 => [G, U, U],

            Self::State => [G, G, U],

            _ => [G, G, G],
        }
    }

    /// Get the name of this opcode
    pub const fn name(self) -> &'static str {
        match self {
            Self::Done => "Done",
            Self::MulF => "MulF",
            Self::MulV => "MulV",
            Self::MulFV => "MulFV",
            Self::MulVF => "MulVF",
            Self::DivF => "DivF",
            Self::AddF => "AddF",
            Self::AddV => "AddV",
            Self::SubF => "SubF",
            Self::SubV => "SubV",
            Self::EqF => "EqF",
            Self::EqV => "EqV",
            Self::EqS => "EqS",
            Self::EqE => "EqE",
            Self::EqFnc => "EqFnc",
            Self::NeF => "NeF",
            Self::NeV => "NeV",
            Self::NeS => "NeS",
            Self::NeE => "NeE",
            Self::NeFnc => "NeFnc",
            Self::Le => "Le",
            Self::Ge => "Ge",
            Self::Lt => "Lt",
            Self::Gt => "Gt",
            Self::LoadF => "LoadF",
            Self::LoadV => "LoadV",
            Self::LoadS => "LoadS",
            Self::LoadEnt => "LoadEnt",
            Self::LoadFld => "LoadFld",
            Self::LoadFnc => "LoadFnc",
            Self::Address => "Address",
            Self::StoreF => "StoreF",
            Self::StoreV => "StoreV",
            Self::StoreS => "StoreS",
            Self::StoreEnt => "StoreEnt",
            Self::StoreFld => "StoreFld",
            Self::StoreFnc => "StoreFnc",
            Self::StorePF => "StorePF",
            Self::StorePV => "StorePV",
            Self::StorePS => "StorePS",
            Self::StorePEnt => "StorePEnt",
            Self::StorePFld => "StorePFld",
            Self::StorePFnc => "StorePFnc",
            Self::Return => "Return",
            Self::NotF => "NotF",
            Self::NotV => "NotV",
            Self::NotS => "NotS",
            Self::NotEnt => "NotEnt",
            Self::NotFnc => "NotFnc",
            Self::If => "If",
            Self::IfNot => "IfNot",
            Self::Call0 => "Call0",
            Self::Call1 => "Call1",
            Self::Call2 => "Call2",
            Self::Call3 => "Call3",
            Self::Call4 => "Call4",
            Self::Call5 => "Call5",
            Self::Call6 => "Call6",
            Self::Call7 => "Call7",
            Self::Call8 => "Call8",
            Self::State => "State",
            Self::Goto => "Goto",
            Self::And => "And",
            Self::Or => "Or",
            Self::BitAnd => "BitAnd",
            Self::BitOr => "BitOr",
            Self::AddI => "AddI",
            Self::SubI => "SubI",
            Self::MulI => "MulI",
            Self::DivI => "DivI",
            Self::ModI => "ModI",
            Self::BitAndI => "BitAndI",
            Self::BitOrI => "BitOrI",
            Self::BitXorI => "BitXorI",
            Self::LShiftI => "LShiftI",
            Self::RShiftI => "RShiftI",
            Self::EqI => "EqI",
            Self::NeI => "NeI",
            Self::LtI => "LtI",
            Self::LeI => "LeI",
            Self::GtI => "GtI",
            Self::GeI => "GeI",
            Self::NotI => "NotI",
            Self::ConvIToF => "ConvIToF",
            Self::ConvFToI => "ConvFToI",
            Self::LoadI => "LoadI",
            Self::StoreI => "StoreI",
            Self::StorePI => "StorePI",
            Self::GlobalAddress => "GlobalAddress",
            Self::LoadPF => "LoadPF",
            Self::LoadPV => "LoadPV",
            Self::LoadPI => "LoadPI",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single decoded statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Operation
    pub op: Opcode,
    /// First operand
    pub a: u16,
    /// Second operand
    pub b: u16,
    /// Third operand
    pub c: u16,
}

impl Statement {
    /// Create a statement from raw operands
    #[inline]
    pub const fn new(op: Opcode, a: u16, b: u16, c: u16) -> Self {
        Self { op, a, b, c }
    }

    /// Create a statement whose operands are all global cells
    #[inline]
    pub const fn globals(op: Opcode, a: GlobalIndex, b: GlobalIndex, c: GlobalIndex) -> Self {
        Self::new(op, a.0, b.0, c.0)
    }

    /// Operand `a` as a global cell
    #[inline]
    pub const fn ga(&self) -> usize {
        self.a as usize
    }

    /// Operand `b` as a global cell
    #[inline]
    pub const fn gb(&self) -> usize {
        self.b as usize
    }

    /// Operand `c` as a global cell
    #[inline]
    pub const fn gc(&self) -> usize {
        self.c as usize
    }

    /// Operand by position (0 = a, 1 = b, 2 = c)
    #[inline]
    pub const fn operand(&self, position: usize) -> u16 {
        match position {
            0 => self.a,
            1 => self.b,
            _ => self.c,
        }
    }

    /// Relative jump carried by this statement, if it is a branch
    pub fn jump(&self) -> Option<JumpOffset> {
        match self.op {
            Opcode::Goto => Some(JumpOffset::from_operand(self.a)),
            Opcode::If | Opcode::IfNot => Some(JumpOffset::from_operand(self.b)),
            _ => None,
        }
    }

    /// Encode into the fixed-width record
    pub fn to_bytes(&self) -> [u8; STATEMENT_SIZE] {
        let mut out = [0u8; STATEMENT_SIZE];
        out[0..2].copy_from_slice(&self.op.to_u16().to_le_bytes());
        out[2..4].copy_from_slice(&self.a.to_le_bytes());
        out[4..6].copy_from_slice(&self.b.to_le_bytes());
        out[6..8].copy_from_slice(&self.c.to_le_bytes());
        out
    }

    /// Decode a fixed-width record
    ///
    /// Returns the raw opcode on failure so the caller can report it.
    pub fn from_bytes(record: &[u8; STATEMENT_SIZE]) -> std::result::Result<Self, u16> {
        let raw = u16::from_le_bytes([record[0], record[1]]);
        let op = Opcode::from_u16(raw).ok_or(raw)?;
        Ok(Self {
            op,
            a: u16::from_le_bytes([record[2], record[3]]),
            b: u16::from_le_bytes([record[4], record[5]]),
            c: u16::from_le_bytes([record[6], record[7]]),
        })
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.jump() {
            Some(offset) if self.op == Opcode::Goto => write!(f, "{} {:+}", self.op, offset.0),
            Some(offset) => write!(f, "{} {} {:+}", self.op, self.a, offset.0),
            None => write!(f, "{} {} {} {}", self.op, self.a, self.b, self.c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for raw in 0..=Opcode::LoadPI as u16 {
            let op = Opcode::from_u16(raw).expect("dense opcode range");
            assert_eq!(op.to_u16(), raw);
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_u16(Opcode::LoadPI as u16 + 1), None);
        assert_eq!(Opcode::from_u16(0xFFFF), None);
    }

    #[test]
    fn test_call_argc() {
        assert_eq!(Opcode::Call0.call_argc(), Some(0));
        assert_eq!(Opcode::Call8.call_argc(), Some(8));
        assert_eq!(Opcode::State.call_argc(), None);
        assert_eq!(Opcode::call(3), Some(Opcode::Call3));
        assert_eq!(Opcode::call(9), None);
    }

    #[test]
    fn test_statement_decode_rejects_unknown_opcode() {
        let mut bytes = Statement::new(Opcode::AddF, 28, 29, 30).to_bytes();
        bytes[0] = 0xFF;
        bytes[1] = 0x7F;
        assert_eq!(Statement::from_bytes(&bytes), Err(0x7FFF));
    }

    #[test]
    fn test_statement_jump() {
        let st = Statement::new(Opcode::IfNot, 30, JumpOffset::new(-2).to_operand(), 0);
        assert_eq!(st.jump(), Some(JumpOffset::new(-2)));
        assert_eq!(st.to_string(), "IfNot 30 -2");
        assert_eq!(Statement::new(Opcode::AddF, 1, 2, 3).jump(), None);
    }
}
