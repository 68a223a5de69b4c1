//! # Progs VM Bytecode
//!
//! Program image format for the progs game-logic virtual machine.
//!
//! ## Design Principles
//!
//! - **Flat**: statements address one shared array of 4-byte global cells
//! - **Fixed-width**: every statement is four `u16`s, every definition is 8 bytes
//! - **Validated once**: operands, jumps and tables are bounds-checked at load,
//!   so the interpreter never sees a structurally broken image

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod builder;
pub mod defs;
pub mod error;
pub mod image;
pub mod instruction;
pub mod operand;

pub use builder::{FieldRef, FunctionRef, ProgramBuilder};
pub use defs::{Definition, EType, FunctionDef};
pub use error::{ProgramFormatError, Result};
pub use image::{FieldLayout, ProgramImage};
pub use instruction::{Opcode, OperandKind, Statement};
pub use operand::{FieldIndex, FunctionIndex, GlobalIndex, JumpOffset};

/// Program image format version
pub const PROGS_VERSION: u32 = 7;

/// Magic bytes for program images
pub const PROGS_MAGIC: [u8; 4] = *b"PRGS";

/// Null cell; always reads as zero
pub const OFS_NULL: u16 = 0;

/// First cell of the (vector wide) return slot
pub const OFS_RETURN: u16 = 1;

/// First cell of parameter slot 0
pub const OFS_PARM0: u16 = 4;

/// Cells per parameter slot (wide enough for a vector)
pub const PARM_CELLS: u16 = 3;

/// Maximum number of parameters passed through the parameter slots
pub const MAX_PARMS: usize = 8;

/// Cells reserved by the calling convention; user globals start here
pub const RESERVED_GLOBALS: u16 = OFS_PARM0 + PARM_CELLS * MAX_PARMS as u16;

/// First cell of parameter slot `n`
#[inline]
pub const fn ofs_parm(n: usize) -> u16 {
    OFS_PARM0 + PARM_CELLS * n as u16
}
