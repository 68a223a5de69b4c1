//! Value representation
//!
//! Memory is a flat array of untyped 4-byte cells. A [`Value`] is what a cell
//! (or three cells, for vectors) means once the static type from a
//! definition table is applied.

use progs_vm_bytecode::{EType, FieldIndex, FunctionIndex};

use crate::string::StringHandle;

/// Entity number
///
/// Entity 0 is the world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EntityIndex(pub u32);

impl EntityIndex {
    /// The world entity
    pub const WORLD: Self = Self(0);

    /// Create a new entity index
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Whether this is the world entity
    #[inline]
    pub const fn is_world(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for EntityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity {}", self.0)
    }
}

/// Byte offset of an entity record inside entity memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct EntityHandle(pub i32);

/// Address produced by `ADDRESS` or `GLOBALADDRESS`
///
/// Entity pointers are a byte address inside entity memory. Global pointers
/// carry [`Pointer::GLOBAL_BIT`] over the byte address of the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Pointer(pub u32);

/// Decoded pointer target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerTarget {
    /// Global cell
    Global(usize),
    /// Byte address inside entity memory
    Entity(u32),
}

impl Pointer {
    /// Marks a pointer into the global array
    pub const GLOBAL_BIT: u32 = 0x8000_0000;

    /// Pointer to a global cell
    #[inline]
    pub const fn global(cell: u16) -> Self {
        Self(Self::GLOBAL_BIT | ((cell as u32) << 2))
    }

    /// Pointer to an entity byte address
    #[inline]
    pub const fn entity(byte: u32) -> Self {
        Self(byte)
    }

    /// Decode the pointer, rejecting misaligned addresses
    pub fn target(self) -> Option<PointerTarget> {
        if self.0 & 3 != 0 {
            return None;
        }
        if self.0 & Self::GLOBAL_BIT != 0 {
            Some(PointerTarget::Global(((self.0 & !Self::GLOBAL_BIT) >> 2) as usize))
        } else {
            Some(PointerTarget::Entity(self.0))
        }
    }
}

/// A decoded VM value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// No value
    Void,
    /// 32-bit float
    Float(f32),
    /// 32-bit integer
    Int(i32),
    /// Three floats
    Vector([f32; 3]),
    /// String handle
    String(StringHandle),
    /// Function table index
    Function(FunctionIndex),
    /// Entity number
    Entity(EntityIndex),
    /// Field cell offset
    Field(FieldIndex),
    /// Pointer into entity or global memory
    Pointer(Pointer),
}

impl Value {
    /// Decode cells by static type
    ///
    /// Vectors read three cells; missing cells read as zero.
    pub fn from_cells(etype: EType, cells: &[u32]) -> Self {
        let cell = |n: usize| cells.get(n).copied().unwrap_or(0);
        match etype {
            EType::Void => Value::Void,
            EType::Float => Value::Float(f32::from_bits(cell(0))),
            EType::Integer => Value::Int(cell(0) as i32),
            EType::Vector => Value::Vector([
                f32::from_bits(cell(0)),
                f32::from_bits(cell(1)),
                f32::from_bits(cell(2)),
            ]),
            EType::String => Value::String(StringHandle(cell(0) as i32)),
            EType::Function => Value::Function(FunctionIndex(cell(0))),
            EType::Entity => Value::Entity(EntityIndex(cell(0))),
            EType::Field => Value::Field(FieldIndex(cell(0))),
            EType::Pointer => Value::Pointer(Pointer(cell(0))),
        }
    }

    /// Encode into cells; returns the cells and how many are used
    pub fn to_cells(&self) -> ([u32; 3], usize) {
        match *self {
            Value::Void => ([0; 3], 0),
            Value::Float(f) => ([f.to_bits(), 0, 0], 1),
            Value::Int(i) => ([i as u32, 0, 0], 1),
            Value::Vector(v) => ([v[0].to_bits(), v[1].to_bits(), v[2].to_bits()], 3),
            Value::String(s) => ([s.0 as u32, 0, 0], 1),
            Value::Function(f) => ([f.0, 0, 0], 1),
            Value::Entity(e) => ([e.0, 0, 0], 1),
            Value::Field(f) => ([f.0, 0, 0], 1),
            Value::Pointer(p) => ([p.0, 0, 0], 1),
        }
    }

    /// Static type this value encodes as
    pub fn etype(&self) -> EType {
        match self {
            Value::Void => EType::Void,
            Value::Float(_) => EType::Float,
            Value::Int(_) => EType::Integer,
            Value::Vector(_) => EType::Vector,
            Value::String(_) => EType::String,
            Value::Function(_) => EType::Function,
            Value::Entity(_) => EType::Entity,
            Value::Field(_) => EType::Field,
            Value::Pointer(_) => EType::Pointer,
        }
    }

    /// Get as float, if this is a float
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as integer, if this is an integer
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as vector, if this is a vector
    pub fn as_vector(&self) -> Option<[f32; 3]> {
        match self {
            Value::Vector(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as entity, if this is an entity
    pub fn as_entity(&self) -> Option<EntityIndex> {
        match self {
            Value::Entity(e) => Some(*e),
            _ => None,
        }
    }

    /// Get as string handle, if this is a string
    pub fn as_string(&self) -> Option<StringHandle> {
        match self {
            Value::String(s) => Some(*s),
            _ => None,
        }
    }

    /// Get as function, if this is a function
    pub fn as_function(&self) -> Option<FunctionIndex> {
        match self {
            Value::Function(f) => Some(*f),
            _ => None,
        }
    }

    /// Whether every cell of the value is zero
    pub fn is_zero(&self) -> bool {
        let (cells, used) = self.to_cells();
        cells[..used].iter().all(|&c| c == 0)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Vector([x, y, z]) => write!(f, "'{x} {y} {z}'"),
            Value::String(s) => write!(f, "string {}", s.0),
            Value::Function(func) => write!(f, "function {}", func.0),
            Value::Entity(e) => write!(f, "{e}"),
            Value::Field(field) => write!(f, ".{}", field.0),
            Value::Pointer(p) => write!(f, "pointer {:#x}", p.0),
        }
    }
}
