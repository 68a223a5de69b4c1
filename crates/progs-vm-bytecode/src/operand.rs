//! Statement operands and typed indices

use serde::{Deserialize, Serialize};

/// Cell index into the global array
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct GlobalIndex(pub u16);

impl GlobalIndex {
    /// The null cell, used for unused operands
    pub const NONE: Self = Self(0);

    /// Create a new global index
    #[inline]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> u16 {
        self.0
    }

    /// Index of the `n`th cell after this one
    #[inline]
    pub const fn offset(self, n: u16) -> Self {
        Self(self.0 + n)
    }
}

impl From<u16> for GlobalIndex {
    fn from(index: u16) -> Self {
        Self(index)
    }
}

impl From<GlobalIndex> for u16 {
    fn from(index: GlobalIndex) -> Self {
        index.0
    }
}

/// Cell offset inside an entity record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FieldIndex(pub u32);

impl FieldIndex {
    /// Create a new field index
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Byte offset of the field inside a record
    #[inline]
    pub const fn byte_offset(self) -> u32 {
        self.0 * 4
    }
}

/// Index into the function table
///
/// Index 0 is the null function; calling it is an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FunctionIndex(pub u32);

impl FunctionIndex {
    /// The null function
    pub const NULL: Self = Self(0);

    /// Create a new function index
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Check for the null function
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Relative jump offset (signed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct JumpOffset(pub i16);

impl JumpOffset {
    /// Create a new jump offset
    #[inline]
    pub const fn new(offset: i16) -> Self {
        Self(offset)
    }

    /// Get offset value
    #[inline]
    pub const fn offset(self) -> i16 {
        self.0
    }

    /// Reinterpret a raw operand as a jump offset
    #[inline]
    pub const fn from_operand(raw: u16) -> Self {
        Self(raw as i16)
    }

    /// Raw operand encoding
    #[inline]
    pub const fn to_operand(self) -> u16 {
        self.0 as u16
    }

    /// Apply the offset to a statement index
    ///
    /// Returns `None` when the target would be negative.
    #[inline]
    pub fn target(self, from: usize) -> Option<usize> {
        from.checked_add_signed(self.0 as isize)
    }
}
