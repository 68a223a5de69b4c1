//! Program assembler
//!
//! Lays out globals, fields, functions and statements the way a compiler
//! would, and emits a valid image. Used by hosts and tests to produce
//! programs without a compiler.

use rustc_hash::FxHashMap;

use crate::defs::{Definition, EType, FunctionDef};
use crate::error::Result;
use crate::image::{ImageParts, ProgramImage};
use crate::instruction::{Opcode, Statement};
use crate::operand::{FieldIndex, FunctionIndex, GlobalIndex, JumpOffset};
use crate::{MAX_PARMS, RESERVED_GLOBALS, ofs_parm};

/// A declared entity field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    /// Cell offset inside entity records
    pub field: FieldIndex,
    /// Global holding the field offset, as a compiler emits it
    pub global: GlobalIndex,
    /// Field type
    pub etype: EType,
}

/// A declared function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    /// Index in the function table
    pub index: FunctionIndex,
    /// Global holding the function handle (the `CALLn` operand)
    pub handle: GlobalIndex,
    /// Parameter cells, one per parameter
    pub params: Vec<GlobalIndex>,
    /// Local cells, one per declared local
    pub locals: Vec<GlobalIndex>,
}

impl FunctionRef {
    /// Parameter `n`
    ///
    /// # Panics
    ///
    /// Panics if the function has fewer than `n + 1` parameters.
    pub fn param(&self, n: usize) -> GlobalIndex {
        self.params[n]
    }

    /// Local `n`
    ///
    /// # Panics
    ///
    /// Panics if the function has fewer than `n + 1` locals.
    pub fn local(&self, n: usize) -> GlobalIndex {
        self.locals[n]
    }
}

/// Builder for program images
#[derive(Debug)]
pub struct ProgramBuilder {
    parts: ImageParts,
    interned: FxHashMap<Vec<u8>, i32>,
    builtin_count: i32,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    /// Create a builder with the reserved globals, a null function and a
    /// terminating statement 0
    pub fn new() -> Self {
        let mut interned = FxHashMap::default();
        interned.insert(Vec::new(), 0);
        Self {
            parts: ImageParts {
                entity_cells: 0,
                statements: vec![Statement::new(Opcode::Done, 0, 0, 0)],
                global_defs: Vec::new(),
                field_defs: Vec::new(),
                functions: vec![FunctionDef::default()],
                strings: vec![0],
                globals: vec![0; RESERVED_GLOBALS as usize],
            },
            interned,
            builtin_count: 0,
        }
    }

    // ==================== Strings ====================

    /// Intern a constant string, returning its offset
    pub fn string(&mut self, s: &str) -> i32 {
        if let Some(&offset) = self.interned.get(s.as_bytes()) {
            return offset;
        }
        let offset = self.parts.strings.len() as i32;
        self.parts.strings.extend_from_slice(s.as_bytes());
        self.parts.strings.push(0);
        self.interned.insert(s.as_bytes().to_vec(), offset);
        offset
    }

    // ==================== Globals ====================

    fn alloc_cells(&mut self, cells: u16) -> GlobalIndex {
        let index = GlobalIndex(self.parts.globals.len() as u16);
        self.parts
            .globals
            .extend(std::iter::repeat_n(0, cells as usize));
        index
    }

    fn define_global(&mut self, name: &str, etype: EType, offset: GlobalIndex, save: bool) {
        let name = self.string(name);
        self.parts.global_defs.push(Definition {
            etype,
            save,
            offset: offset.0,
            name,
        });
    }

    /// Declare a named global, initialized to zero
    pub fn global(&mut self, name: &str, etype: EType) -> GlobalIndex {
        let index = self.alloc_cells(etype.cells());
        self.define_global(name, etype, index, false);
        index
    }

    /// Declare a named global that belongs in saved games
    pub fn saved_global(&mut self, name: &str, etype: EType) -> GlobalIndex {
        let index = self.alloc_cells(etype.cells());
        self.define_global(name, etype, index, true);
        index
    }

    /// Set the initial value of a cell
    pub fn set_initial(&mut self, index: GlobalIndex, bits: u32) {
        self.parts.globals[index.0 as usize] = bits;
    }

    /// Anonymous float constant
    pub fn constant_float(&mut self, value: f32) -> GlobalIndex {
        let index = self.alloc_cells(1);
        self.set_initial(index, value.to_bits());
        index
    }

    /// Anonymous integer constant
    pub fn constant_int(&mut self, value: i32) -> GlobalIndex {
        let index = self.alloc_cells(1);
        self.set_initial(index, value as u32);
        index
    }

    /// Anonymous vector constant
    pub fn constant_vector(&mut self, value: [f32; 3]) -> GlobalIndex {
        let index = self.alloc_cells(3);
        for (n, component) in value.into_iter().enumerate() {
            self.set_initial(index.offset(n as u16), component.to_bits());
        }
        index
    }

    /// Anonymous string constant
    pub fn constant_string(&mut self, value: &str) -> GlobalIndex {
        let offset = self.string(value);
        let index = self.alloc_cells(1);
        self.set_initial(index, offset as u32);
        index
    }

    // ==================== Fields ====================

    /// Declare an entity field and the global holding its offset
    pub fn field(&mut self, name: &str, etype: EType) -> FieldRef {
        let field = FieldIndex(self.parts.entity_cells);
        self.parts.entity_cells += etype.cells() as u32;
        let name_offset = self.string(name);
        self.parts.field_defs.push(Definition {
            etype,
            save: false,
            offset: field.0 as u16,
            name: name_offset,
        });

        let global = self.alloc_cells(1);
        self.set_initial(global, field.0);
        self.define_global(name, EType::Field, global, false);
        FieldRef {
            field,
            global,
            etype,
        }
    }

    /// Reserve trailing entity cells not described by any field
    pub fn reserve_entity_cells(&mut self, cells: u32) {
        self.parts.entity_cells += cells;
    }

    // ==================== Functions ====================

    fn define_function_handle(&mut self, name: &str, index: FunctionIndex) -> GlobalIndex {
        let handle = self.alloc_cells(1);
        self.set_initial(handle, index.0);
        self.define_global(name, EType::Function, handle, false);
        handle
    }

    fn param_sizes(params: &[EType]) -> [u8; MAX_PARMS] {
        let mut sizes = [0u8; MAX_PARMS];
        for (size, etype) in sizes.iter_mut().zip(params) {
            *size = etype.cells() as u8;
        }
        sizes
    }

    /// Declare a program function whose body starts at the next emitted
    /// statement
    ///
    /// Parameters and locals are laid out contiguously as the function's
    /// locals window.
    ///
    /// # Panics
    ///
    /// Panics if more than eight parameters are declared.
    pub fn function(&mut self, name: &str, params: &[EType], locals: &[EType]) -> FunctionRef {
        assert!(params.len() <= MAX_PARMS, "at most {MAX_PARMS} parameters");

        let parm_start = self.parts.globals.len() as u32;
        let param_globals: Vec<_> = params
            .iter()
            .map(|etype| self.alloc_cells(etype.cells()))
            .collect();
        let local_globals: Vec<_> = locals
            .iter()
            .map(|etype| self.alloc_cells(etype.cells()))
            .collect();
        let window = self.parts.globals.len() as u32 - parm_start;

        let index = FunctionIndex(self.parts.functions.len() as u32);
        let name_offset = self.string(name);
        self.parts.functions.push(FunctionDef {
            first_statement: self.parts.statements.len() as i32,
            parm_start,
            locals: window,
            profile: 0,
            name: name_offset,
            file: 0,
            num_parms: params.len() as u32,
            parm_size: Self::param_sizes(params),
        });
        let handle = self.define_function_handle(name, index);

        FunctionRef {
            index,
            handle,
            params: param_globals,
            locals: local_globals,
        }
    }

    /// Declare a host builtin by name
    ///
    /// # Panics
    ///
    /// Panics if more than eight parameters are declared.
    pub fn builtin(&mut self, name: &str, params: &[EType]) -> FunctionRef {
        assert!(params.len() <= MAX_PARMS, "at most {MAX_PARMS} parameters");

        self.builtin_count += 1;
        let index = FunctionIndex(self.parts.functions.len() as u32);
        let name_offset = self.string(name);
        self.parts.functions.push(FunctionDef {
            first_statement: -self.builtin_count,
            parm_start: 0,
            locals: 0,
            profile: 0,
            name: name_offset,
            file: 0,
            num_parms: params.len() as u32,
            parm_size: Self::param_sizes(params),
        });
        let handle = self.define_function_handle(name, index);

        FunctionRef {
            index,
            handle,
            params: Vec::new(),
            locals: Vec::new(),
        }
    }

    // ==================== Statements ====================

    /// Index the next emitted statement will get
    pub fn next_statement(&self) -> usize {
        self.parts.statements.len()
    }

    /// Append a raw statement, returning its index
    pub fn emit_raw(&mut self, statement: Statement) -> usize {
        self.parts.statements.push(statement);
        self.parts.statements.len() - 1
    }

    /// Append a statement whose operands are all global cells
    pub fn emit(&mut self, op: Opcode, a: GlobalIndex, b: GlobalIndex, c: GlobalIndex) -> usize {
        self.emit_raw(Statement::globals(op, a, b, c))
    }

    /// Copy `value` into parameter slot `n` ahead of a call
    pub fn arg(&mut self, n: usize, value: GlobalIndex, etype: EType) -> usize {
        let op = match etype {
            EType::Vector => Opcode::StoreV,
            EType::String => Opcode::StoreS,
            EType::Entity => Opcode::StoreEnt,
            EType::Field => Opcode::StoreFld,
            EType::Function => Opcode::StoreFnc,
            EType::Integer | EType::Pointer => Opcode::StoreI,
            EType::Float | EType::Void => Opcode::StoreF,
        };
        self.emit(op, value, GlobalIndex(ofs_parm(n)), GlobalIndex::NONE)
    }

    /// Call the function whose handle is in `function` with `argc` arguments
    ///
    /// # Panics
    ///
    /// Panics if `argc` is greater than eight.
    pub fn call(&mut self, function: GlobalIndex, argc: usize) -> usize {
        let op = Opcode::call(argc).unwrap_or_else(|| panic!("at most {MAX_PARMS} arguments"));
        self.emit(op, function, GlobalIndex::NONE, GlobalIndex::NONE)
    }

    /// Return `value` (use `GlobalIndex::NONE` for no value)
    pub fn ret(&mut self, value: GlobalIndex) -> usize {
        self.emit(Opcode::Return, value, GlobalIndex::NONE, GlobalIndex::NONE)
    }

    /// Unconditional relative jump
    pub fn goto(&mut self, offset: i16) -> usize {
        self.emit_raw(Statement::new(
            Opcode::Goto,
            JumpOffset::new(offset).to_operand(),
            0,
            0,
        ))
    }

    /// Jump by `offset` when `cond` is non-zero
    pub fn if_true(&mut self, cond: GlobalIndex, offset: i16) -> usize {
        self.emit_raw(Statement::new(
            Opcode::If,
            cond.0,
            JumpOffset::new(offset).to_operand(),
            0,
        ))
    }

    /// Jump by `offset` when `cond` is zero
    pub fn if_false(&mut self, cond: GlobalIndex, offset: i16) -> usize {
        self.emit_raw(Statement::new(
            Opcode::IfNot,
            cond.0,
            JumpOffset::new(offset).to_operand(),
            0,
        ))
    }

    /// Rewrite the jump offset of an already emitted branch
    pub fn patch_jump(&mut self, statement: usize, target: usize) {
        let offset = JumpOffset::new((target as isize - statement as isize) as i16).to_operand();
        let st = &mut self.parts.statements[statement];
        match st.op {
            Opcode::Goto => st.a = offset,
            _ => st.b = offset,
        }
    }

    // ==================== Output ====================

    /// Encode the image without validating it
    pub fn to_bytes(&self) -> Vec<u8> {
        self.parts.encode()
    }

    /// Encode and validate the image
    pub fn build(&self) -> Result<ProgramImage> {
        ProgramImage::from_bytes(&self.to_bytes())
    }
}
