//! Program image: binary layout, validation and symbol lookup

use rustc_hash::FxHashMap;

use crate::defs::{DEF_SIZE, Definition, EType, FUNCTION_SIZE, FunctionDef};
use crate::error::{ProgramFormatError, Result};
use crate::instruction::{OperandKind, STATEMENT_SIZE, Statement};
use crate::operand::{FieldIndex, FunctionIndex, GlobalIndex};
use crate::{MAX_PARMS, PROGS_MAGIC, PROGS_VERSION, RESERVED_GLOBALS};

/// Size of the fixed image header in bytes
pub const HEADER_SIZE: usize = 64;

/// Section order in the header's offset/count table
const SECTIONS: [&str; 6] = [
    "statements",
    "global_defs",
    "field_defs",
    "functions",
    "strings",
    "globals",
];

/// Decoded, not yet validated, image contents
#[derive(Debug, Clone, Default)]
pub(crate) struct ImageParts {
    pub entity_cells: u32,
    pub statements: Vec<Statement>,
    pub global_defs: Vec<Definition>,
    pub field_defs: Vec<Definition>,
    pub functions: Vec<FunctionDef>,
    pub strings: Vec<u8>,
    pub globals: Vec<u32>,
}

impl ImageParts {
    /// CRC-32 over the encoded global and field definition tables
    pub fn definitions_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for def in self.global_defs.iter().chain(self.field_defs.iter()) {
            hasher.update(&def.to_bytes());
        }
        hasher.finalize()
    }

    /// Encode into the binary layout
    pub fn encode(&self) -> Vec<u8> {
        let statements: Vec<u8> = self.statements.iter().flat_map(|s| s.to_bytes()).collect();
        let global_defs: Vec<u8> = self.global_defs.iter().flat_map(|d| d.to_bytes()).collect();
        let field_defs: Vec<u8> = self.field_defs.iter().flat_map(|d| d.to_bytes()).collect();
        let functions: Vec<u8> = self.functions.iter().flat_map(|f| f.to_bytes()).collect();
        let globals: Vec<u8> = self.globals.iter().flat_map(|g| g.to_le_bytes()).collect();

        let sections: [(&[u8], usize); 6] = [
            (&statements, self.statements.len()),
            (&global_defs, self.global_defs.len()),
            (&field_defs, self.field_defs.len()),
            (&functions, self.functions.len()),
            (&self.strings, self.strings.len()),
            (&globals, self.globals.len()),
        ];

        let mut out = Vec::with_capacity(
            HEADER_SIZE + sections.iter().map(|(data, _)| data.len()).sum::<usize>(),
        );
        out.extend_from_slice(&PROGS_MAGIC);
        out.extend_from_slice(&PROGS_VERSION.to_le_bytes());
        out.extend_from_slice(&self.definitions_checksum().to_le_bytes());
        out.extend_from_slice(&self.entity_cells.to_le_bytes());

        let mut offset = HEADER_SIZE;
        for (data, count) in &sections {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(&(*count as u32).to_le_bytes());
            offset += data.len();
        }
        for (data, _) in &sections {
            out.extend_from_slice(data);
        }
        out
    }
}

/// A validated program image
///
/// Immutable once loaded; VM instances share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    parts: ImageParts,
    checksum: u32,
    function_names: Vec<Box<str>>,
    functions_by_name: FxHashMap<Box<str>, FunctionIndex>,
    globals_by_name: FxHashMap<Box<str>, usize>,
    globals_by_offset: FxHashMap<u16, usize>,
    fields_by_name: FxHashMap<Box<str>, usize>,
}

impl ProgramImage {
    /// Create a new program builder
    pub fn builder() -> crate::builder::ProgramBuilder {
        crate::builder::ProgramBuilder::new()
    }

    /// Decode and validate an image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProgramFormatError::UnexpectedEnd);
        }
        if bytes[0..4] != PROGS_MAGIC {
            return Err(ProgramFormatError::InvalidMagic);
        }
        let version = le_u32(bytes, 4);
        if version != PROGS_VERSION {
            return Err(ProgramFormatError::UnsupportedVersion(version));
        }
        let checksum = le_u32(bytes, 8);
        let entity_cells = le_u32(bytes, 12);

        let statements = section(bytes, 0, STATEMENT_SIZE)?
            .chunks_exact(STATEMENT_SIZE)
            .enumerate()
            .map(|(statement, chunk)| {
                let mut record = [0u8; STATEMENT_SIZE];
                record.copy_from_slice(chunk);
                Statement::from_bytes(&record)
                    .map_err(|opcode| ProgramFormatError::InvalidOpcode { statement, opcode })
            })
            .collect::<Result<Vec<_>>>()?;
        let global_defs = decode_defs(section(bytes, 1, DEF_SIZE)?, "global")?;
        let field_defs = decode_defs(section(bytes, 2, DEF_SIZE)?, "field")?;
        let functions = section(bytes, 3, FUNCTION_SIZE)?
            .chunks_exact(FUNCTION_SIZE)
            .map(|chunk| {
                let mut record = [0u8; FUNCTION_SIZE];
                record.copy_from_slice(chunk);
                FunctionDef::from_bytes(&record)
            })
            .collect();
        let strings = section(bytes, 4, 1)?.to_vec();
        let globals = section(bytes, 5, 4)?
            .chunks_exact(4)
            .map(|chunk| le_u32(chunk, 0))
            .collect();

        let parts = ImageParts {
            entity_cells,
            statements,
            global_defs,
            field_defs,
            functions,
            strings,
            globals,
        };

        let found = parts.definitions_checksum();
        if found != checksum {
            return Err(ProgramFormatError::ChecksumMismatch {
                expected: checksum,
                found,
            });
        }

        Self::from_parts(parts)
    }

    /// Validate decoded parts and build lookup tables
    fn from_parts(parts: ImageParts) -> Result<Self> {
        validate_strings(&parts.strings)?;
        if parts.globals.len() < RESERVED_GLOBALS as usize {
            return Err(ProgramFormatError::ReservedGlobals {
                count: parts.globals.len(),
                required: RESERVED_GLOBALS as usize,
            });
        }
        if parts.functions.is_empty() {
            return Err(ProgramFormatError::BadFunction {
                index: 0,
                reason: "function table has no null entry".into(),
            });
        }

        let checksum = parts.definitions_checksum();
        let mut image = Self {
            parts,
            checksum,
            function_names: Vec::new(),
            functions_by_name: FxHashMap::default(),
            globals_by_name: FxHashMap::default(),
            globals_by_offset: FxHashMap::default(),
            fields_by_name: FxHashMap::default(),
        };

        image.validate_definitions()?;
        image.validate_functions()?;
        image.validate_statements()?;
        image.build_indices();
        Ok(image)
    }

    /// Encode back into the binary layout
    pub fn to_bytes(&self) -> Vec<u8> {
        self.parts.encode()
    }

    fn validate_definitions(&self) -> Result<()> {
        let global_count = self.parts.globals.len();
        for def in &self.parts.global_defs {
            self.check_string(def.name)?;
            if def.offset as usize + def.etype.cells() as usize > global_count {
                return Err(ProgramFormatError::DefinitionOutOfRange {
                    table: "global",
                    name: self.name(def.name).to_string(),
                    offset: def.offset,
                });
            }
        }
        for def in &self.parts.field_defs {
            self.check_string(def.name)?;
            if def.offset as u64 + def.etype.cells() as u64 > self.parts.entity_cells as u64 {
                return Err(ProgramFormatError::DefinitionOutOfRange {
                    table: "field",
                    name: self.name(def.name).to_string(),
                    offset: def.offset,
                });
            }
        }
        Ok(())
    }

    fn validate_functions(&self) -> Result<()> {
        let bad = |index: usize, reason: String| ProgramFormatError::BadFunction { index, reason };
        for (index, func) in self.parts.functions.iter().enumerate() {
            self.check_string(func.name)?;
            self.check_string(func.file)?;
            if func.is_builtin() {
                continue;
            }
            if func.first_statement as usize >= self.parts.statements.len() && index != 0 {
                return Err(bad(
                    index,
                    format!("first statement {} out of range", func.first_statement),
                ));
            }
            if func.parm_start as u64 + func.locals as u64 > self.parts.globals.len() as u64 {
                return Err(bad(
                    index,
                    format!(
                        "locals window {}+{} exceeds {} globals",
                        func.parm_start,
                        func.locals,
                        self.parts.globals.len()
                    ),
                ));
            }
            if func.num_parms as usize > MAX_PARMS {
                return Err(bad(index, format!("{} parameters", func.num_parms)));
            }
            let sizes = &func.parm_size[..func.num_parms as usize];
            if sizes.iter().any(|&size| size != 1 && size != 3) {
                return Err(bad(index, "parameter size must be 1 or 3".into()));
            }
            if func.param_cells() > func.locals {
                return Err(bad(index, "parameters exceed locals window".into()));
            }
        }
        Ok(())
    }

    fn validate_statements(&self) -> Result<()> {
        let global_count = self.parts.globals.len();
        let statement_count = self.parts.statements.len();
        for (index, st) in self.parts.statements.iter().enumerate() {
            for (position, kind) in st.op.operand_kinds().into_iter().enumerate() {
                let value = st.operand(position);
                let in_range = match kind {
                    OperandKind::Unused => true,
                    OperandKind::Global => (value as usize) < global_count,
                    OperandKind::Vector => (value as usize) + 2 < global_count,
                    OperandKind::Jump => {
                        let offset = crate::operand::JumpOffset::from_operand(value);
                        match offset.target(index) {
                            Some(target) if target < statement_count => true,
                            _ => {
                                return Err(ProgramFormatError::JumpOutOfRange {
                                    statement: index,
                                    offset: offset.offset(),
                                });
                            }
                        }
                    }
                };
                if !in_range {
                    return Err(ProgramFormatError::OperandOutOfRange {
                        statement: index,
                        opcode: st.op.name(),
                        operand: ['a', 'b', 'c'][position],
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    fn build_indices(&mut self) {
        let mut function_names = Vec::with_capacity(self.parts.functions.len());
        let mut functions_by_name = FxHashMap::default();
        for (index, func) in self.parts.functions.iter().enumerate() {
            let name: Box<str> = self.name(func.name).into();
            if index != 0 && !name.is_empty() {
                functions_by_name
                    .entry(name.clone())
                    .or_insert(FunctionIndex(index as u32));
            }
            function_names.push(name);
        }

        let mut globals_by_name = FxHashMap::default();
        let mut globals_by_offset = FxHashMap::default();
        for (index, def) in self.parts.global_defs.iter().enumerate() {
            let name = self.name(def.name);
            if !name.is_empty() {
                globals_by_name.entry(name.into()).or_insert(index);
            }
            globals_by_offset.entry(def.offset).or_insert(index);
        }

        let mut fields_by_name = FxHashMap::default();
        for (index, def) in self.parts.field_defs.iter().enumerate() {
            let name = self.name(def.name);
            if !name.is_empty() {
                fields_by_name.entry(name.into()).or_insert(index);
            }
        }

        self.function_names = function_names;
        self.functions_by_name = functions_by_name;
        self.globals_by_name = globals_by_name;
        self.globals_by_offset = globals_by_offset;
        self.fields_by_name = fields_by_name;
    }

    fn check_string(&self, offset: i32) -> Result<()> {
        if offset < 0 || offset as usize >= self.parts.strings.len() {
            return Err(ProgramFormatError::BadStringOffset(offset));
        }
        Ok(())
    }

    // ==================== Accessors ====================

    /// Checksum of the definition tables
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Entity record width declared by the program, in cells
    pub fn entity_cells(&self) -> u32 {
        self.parts.entity_cells
    }

    /// The statement stream
    pub fn statements(&self) -> &[Statement] {
        &self.parts.statements
    }

    /// Initial global cell values
    pub fn initial_globals(&self) -> &[u32] {
        &self.parts.globals
    }

    /// Global definition table
    pub fn global_defs(&self) -> &[Definition] {
        &self.parts.global_defs
    }

    /// Field definition table
    pub fn field_defs(&self) -> &[Definition] {
        &self.parts.field_defs
    }

    /// Function table (index 0 is the null function)
    pub fn functions(&self) -> &[FunctionDef] {
        &self.parts.functions
    }

    /// The raw string blob
    pub fn strings(&self) -> &[u8] {
        &self.parts.strings
    }

    /// Get a function by index
    pub fn function(&self, index: FunctionIndex) -> Option<&FunctionDef> {
        self.parts.functions.get(index.0 as usize)
    }

    /// Name of a function, or `<invalid>` for an unknown index
    pub fn function_name(&self, index: FunctionIndex) -> &str {
        self.function_names
            .get(index.0 as usize)
            .map(|name| name.as_ref())
            .unwrap_or("<invalid>")
    }

    /// Look up a function by name
    pub fn find_function(&self, name: &str) -> Option<FunctionIndex> {
        self.functions_by_name.get(name).copied()
    }

    /// Builtin declarations: function index and name
    pub fn builtins(&self) -> impl Iterator<Item = (FunctionIndex, &str)> {
        self.parts
            .functions
            .iter()
            .enumerate()
            .filter(|(_, func)| func.is_builtin())
            .map(|(index, _)| {
                let index = FunctionIndex(index as u32);
                (index, self.function_name(index))
            })
    }

    /// Look up a global definition by name
    pub fn find_global(&self, name: &str) -> Option<&Definition> {
        self.globals_by_name
            .get(name)
            .map(|&index| &self.parts.global_defs[index])
    }

    /// Definition declared at a global cell
    pub fn global_def_at(&self, offset: GlobalIndex) -> Option<&Definition> {
        self.globals_by_offset
            .get(&offset.0)
            .map(|&index| &self.parts.global_defs[index])
    }

    /// Look up a field definition by name
    pub fn find_field(&self, name: &str) -> Option<&Definition> {
        self.fields_by_name
            .get(name)
            .map(|&index| &self.parts.field_defs[index])
    }

    /// Bytes of the constant string at `offset`, up to its NUL
    pub fn string_at(&self, offset: i32) -> Option<&[u8]> {
        if offset < 0 {
            return None;
        }
        let tail = self.parts.strings.get(offset as usize..)?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Some(&tail[..end])
    }

    /// Constant string as text; empty for invalid offsets or non-UTF-8 bytes
    pub fn name(&self, offset: i32) -> &str {
        self.string_at(offset)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .unwrap_or("")
    }

    /// Field layout the host's native entity structure must agree with
    pub fn field_layout(&self) -> FieldLayout {
        let mut fields: Vec<_> = self
            .parts
            .field_defs
            .iter()
            .filter(|def| def.name != 0)
            .map(|def| {
                (
                    Box::<str>::from(self.name(def.name)),
                    def.etype,
                    FieldIndex(def.offset as u32),
                )
            })
            .collect();
        fields.sort_by_key(|(_, _, offset)| *offset);
        FieldLayout { fields }
    }
}

/// Named field offsets of an image, ordered by offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    fields: Vec<(Box<str>, EType, FieldIndex)>,
}

impl FieldLayout {
    /// Look up a field by name
    pub fn get(&self, name: &str) -> Option<(EType, FieldIndex)> {
        self.fields
            .iter()
            .find(|(field, _, _)| field.as_ref() == name)
            .map(|&(_, etype, offset)| (etype, offset))
    }

    /// Iterate over `(name, type, offset)`
    pub fn iter(&self) -> impl Iterator<Item = (&str, EType, FieldIndex)> {
        self.fields
            .iter()
            .map(|(name, etype, offset)| (name.as_ref(), *etype, *offset))
    }

    /// Number of named fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the layout has no named fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Cross-check constant over names, types and offsets
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for (name, etype, offset) in &self.fields {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(&(*etype as u16).to_le_bytes());
            hasher.update(&offset.0.to_le_bytes());
        }
        hasher.finalize()
    }
}

#[inline]
fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Slice out section `index` of the header table
fn section(bytes: &[u8], index: usize, record: usize) -> Result<&[u8]> {
    let entry = 16 + index * 8;
    let offset = le_u32(bytes, entry);
    let count = le_u32(bytes, entry + 4);
    let out_of_bounds = || ProgramFormatError::SectionOutOfBounds {
        section: SECTIONS[index],
        offset,
        count,
    };
    let start = offset as usize;
    let end = (count as usize)
        .checked_mul(record)
        .and_then(|len| len.checked_add(start))
        .ok_or_else(out_of_bounds)?;
    if start < HEADER_SIZE && count > 0 {
        return Err(out_of_bounds());
    }
    bytes.get(start..end).ok_or_else(out_of_bounds)
}

fn decode_defs(data: &[u8], table: &'static str) -> Result<Vec<Definition>> {
    data.chunks_exact(DEF_SIZE)
        .enumerate()
        .map(|(index, chunk)| {
            let mut record = [0u8; DEF_SIZE];
            record.copy_from_slice(chunk);
            Definition::from_bytes(&record)
                .map_err(|tag| ProgramFormatError::InvalidTypeTag { table, index, tag })
        })
        .collect()
}

fn validate_strings(strings: &[u8]) -> Result<()> {
    match (strings.first(), strings.last()) {
        (Some(0), Some(0)) => Ok(()),
        _ => Err(ProgramFormatError::MalformedStrings),
    }
}
