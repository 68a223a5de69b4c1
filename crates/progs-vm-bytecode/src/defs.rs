//! Definition tables: globals, fields and functions

use serde::{Deserialize, Serialize};

use crate::MAX_PARMS;
use crate::operand::GlobalIndex;

/// Size of one encoded global/field definition in bytes
pub const DEF_SIZE: usize = 8;

/// Size of one encoded function record in bytes
pub const FUNCTION_SIZE: usize = 36;

/// Type tag bit marking a global that belongs in saved games
pub const DEF_SAVEGLOBAL: u16 = 0x8000;

/// Static type of a global or field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum EType {
    /// No value
    Void = 0,
    /// String handle
    String = 1,
    /// 32-bit float
    Float = 2,
    /// Three floats
    Vector = 3,
    /// Entity number
    Entity = 4,
    /// Field offset
    Field = 5,
    /// Function index
    Function = 6,
    /// Pointer into entity or global memory
    Pointer = 7,
    /// 32-bit integer
    Integer = 8,
}

impl EType {
    /// Decode a type tag, ignoring the save-global bit
    pub fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag & !DEF_SAVEGLOBAL {
            0 => Self::Void,
            1 => Self::String,
            2 => Self::Float,
            3 => Self::Vector,
            4 => Self::Entity,
            5 => Self::Field,
            6 => Self::Function,
            7 => Self::Pointer,
            8 => Self::Integer,
            _ => return None,
        })
    }

    /// Number of 4-byte cells a value of this type occupies
    #[inline]
    pub const fn cells(self) -> u16 {
        match self {
            Self::Vector => 3,
            _ => 1,
        }
    }

    /// Lowercase type name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::String => "string",
            Self::Float => "float",
            Self::Vector => "vector",
            Self::Entity => "entity",
            Self::Field => "field",
            Self::Function => "function",
            Self::Pointer => "pointer",
            Self::Integer => "int",
        }
    }
}

impl std::fmt::Display for EType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A global or field definition record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Static type
    pub etype: EType,
    /// Save-global flag (globals only)
    pub save: bool,
    /// Global cell, or field cell inside an entity record
    pub offset: u16,
    /// Name offset into the string blob
    pub name: i32,
}

impl Definition {
    /// Encode into the fixed-width record
    pub fn to_bytes(&self) -> [u8; DEF_SIZE] {
        let mut tag = self.etype as u16;
        if self.save {
            tag |= DEF_SAVEGLOBAL;
        }
        let mut out = [0u8; DEF_SIZE];
        out[0..2].copy_from_slice(&tag.to_le_bytes());
        out[2..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.name.to_le_bytes());
        out
    }

    /// Decode a record; the raw tag is returned when it is unknown
    pub fn from_bytes(record: &[u8; DEF_SIZE]) -> std::result::Result<Self, u16> {
        let tag = u16::from_le_bytes([record[0], record[1]]);
        let etype = EType::from_tag(tag).ok_or(tag)?;
        Ok(Self {
            etype,
            save: tag & DEF_SAVEGLOBAL != 0,
            offset: u16::from_le_bytes([record[2], record[3]]),
            name: i32::from_le_bytes([record[4], record[5], record[6], record[7]]),
        })
    }

    /// Global cell addressed by this definition
    #[inline]
    pub fn global(&self) -> GlobalIndex {
        GlobalIndex(self.offset)
    }
}

/// A function table entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// First statement; negative marks a builtin declaration
    pub first_statement: i32,
    /// First global cell of the locals window (parameters come first)
    pub parm_start: u32,
    /// Size of the locals window in cells
    pub locals: u32,
    /// Reserved for compiler profiling data
    pub profile: u32,
    /// Name offset into the string blob
    pub name: i32,
    /// Source file name offset into the string blob
    pub file: i32,
    /// Number of parameters
    pub num_parms: u32,
    /// Cells per parameter (1 or 3)
    pub parm_size: [u8; MAX_PARMS],
}

impl FunctionDef {
    /// Whether this entry declares a host builtin
    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.first_statement < 0
    }

    /// Total cells taken by the parameters
    pub fn param_cells(&self) -> u32 {
        self.parm_size
            .iter()
            .take(self.num_parms as usize)
            .map(|&size| size as u32)
            .sum()
    }

    /// Encode into the fixed-width record
    pub fn to_bytes(&self) -> [u8; FUNCTION_SIZE] {
        let mut out = [0u8; FUNCTION_SIZE];
        out[0..4].copy_from_slice(&self.first_statement.to_le_bytes());
        out[4..8].copy_from_slice(&self.parm_start.to_le_bytes());
        out[8..12].copy_from_slice(&self.locals.to_le_bytes());
        out[12..16].copy_from_slice(&self.profile.to_le_bytes());
        out[16..20].copy_from_slice(&self.name.to_le_bytes());
        out[20..24].copy_from_slice(&self.file.to_le_bytes());
        out[24..28].copy_from_slice(&self.num_parms.to_le_bytes());
        out[28..36].copy_from_slice(&self.parm_size);
        out
    }

    /// Decode a record
    pub fn from_bytes(record: &[u8; FUNCTION_SIZE]) -> Self {
        let word = |at: usize| [record[at], record[at + 1], record[at + 2], record[at + 3]];
        let mut parm_size = [0u8; MAX_PARMS];
        parm_size.copy_from_slice(&record[28..36]);
        Self {
            first_statement: i32::from_le_bytes(word(0)),
            parm_start: u32::from_le_bytes(word(4)),
            locals: u32::from_le_bytes(word(8)),
            profile: u32::from_le_bytes(word(12)),
            name: i32::from_le_bytes(word(16)),
            file: i32::from_le_bytes(word(20)),
            num_parms: u32::from_le_bytes(word(24)),
            parm_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_global_flag() {
        let def = Definition {
            etype: EType::Vector,
            save: true,
            offset: 40,
            name: 9,
        };
        let bytes = def.to_bytes();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 3 | DEF_SAVEGLOBAL);
        assert_eq!(Definition::from_bytes(&bytes), Ok(def));
    }

    #[test]
    fn test_unknown_type_tag() {
        let mut bytes = [0u8; DEF_SIZE];
        bytes[0] = 42;
        assert_eq!(Definition::from_bytes(&bytes), Err(42));
    }

    #[test]
    fn test_param_cells() {
        let def = FunctionDef {
            num_parms: 2,
            parm_size: [3, 1, 3, 0, 0, 0, 0, 0],
            ..Default::default()
        };
        assert_eq!(def.param_cells(), 4);
        assert!(!def.is_builtin());
    }
}
