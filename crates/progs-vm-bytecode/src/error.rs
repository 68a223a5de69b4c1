//! Program image errors

use thiserror::Error;

/// Errors raised while decoding or validating a program image
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgramFormatError {
    /// Invalid magic bytes in the header
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Unsupported format version
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// Image is shorter than its header claims
    #[error("Unexpected end of program image")]
    UnexpectedEnd,

    /// A section's offset/count pair points outside the image
    #[error("Section {section} out of bounds (offset {offset}, count {count})")]
    SectionOutOfBounds {
        /// Section name
        section: &'static str,
        /// Byte offset from the header
        offset: u32,
        /// Record count from the header
        count: u32,
    },

    /// Global array is smaller than the reserved calling-convention area
    #[error("Program declares {count} globals, at least {required} are reserved")]
    ReservedGlobals {
        /// Declared global count
        count: usize,
        /// Reserved cell count
        required: usize,
    },

    /// Unknown opcode in the statement stream
    #[error("Invalid opcode {opcode} at statement {statement}")]
    InvalidOpcode {
        /// Statement index
        statement: usize,
        /// Raw opcode value
        opcode: u16,
    },

    /// Statement operand outside the global array
    #[error("Statement {statement} ({opcode}): operand {operand} = {value} out of range")]
    OperandOutOfRange {
        /// Statement index
        statement: usize,
        /// Opcode name
        opcode: &'static str,
        /// Operand letter (`a`, `b` or `c`)
        operand: char,
        /// Raw operand value
        value: u16,
    },

    /// Relative jump landing outside the statement stream
    #[error("Statement {statement}: jump by {offset} leaves the statement stream")]
    JumpOutOfRange {
        /// Statement index
        statement: usize,
        /// Relative offset
        offset: i16,
    },

    /// Unknown definition type tag
    #[error("Invalid type tag {tag:#06x} in {table} definition {index}")]
    InvalidTypeTag {
        /// Table name
        table: &'static str,
        /// Definition index
        index: usize,
        /// Raw tag
        tag: u16,
    },

    /// Definition addressing cells outside its storage
    #[error("{table} definition `{name}` at offset {offset} out of range")]
    DefinitionOutOfRange {
        /// Table name
        table: &'static str,
        /// Definition name
        name: String,
        /// Declared offset
        offset: u16,
    },

    /// Malformed function table entry
    #[error("Function {index}: {reason}")]
    BadFunction {
        /// Function index
        index: usize,
        /// What is wrong with it
        reason: String,
    },

    /// String offset outside the string blob
    #[error("String offset {0} out of range")]
    BadStringOffset(i32),

    /// String blob does not start and end with NUL
    #[error("Malformed string blob")]
    MalformedStrings,

    /// Definition-table checksum differs from the expected value
    #[error("Checksum mismatch: expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch {
        /// Expected checksum
        expected: u32,
        /// Checksum of the definition tables
        found: u32,
    },

    /// A symbol the host requires is missing from the image
    #[error("Required {kind} `{name}` not found")]
    MissingRequired {
        /// Symbol kind (`function`, `global` or `field`)
        kind: &'static str,
        /// Symbol name
        name: String,
    },
}

/// Result type for program image operations
pub type Result<T> = std::result::Result<T, ProgramFormatError>;
