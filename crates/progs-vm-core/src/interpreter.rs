//! Statement interpreter
//!
//! Runs program functions against one instance's memory. Statement operands
//! are global cells checked at load; entity numbers, field offsets, pointers
//! and string handles come out of memory and are checked here.

use std::sync::Arc;

use progs_vm_bytecode::{
    FieldIndex, FunctionIndex, OFS_NULL, OFS_RETURN, Opcode, ProgramImage, Statement,
};
use tracing::trace;

use crate::builtin::BuiltinContext;
use crate::error::{AccessError, ExecutionError, TraceFrame, VmError, VmResult};
use crate::instance::VmInstance;
use crate::memory::{load_pointer, store_pointer};
use crate::string::StringHandle;
use crate::value::{EntityIndex, Pointer, PointerTarget};

/// What the loop does after a statement
enum StepResult {
    /// Advance to the next statement
    Next,
    /// Continue at an absolute statement
    Jump(usize),
    /// A frame was pushed and the statement pointer set
    Entered,
    /// The current function returned
    Leave,
}

/// The statement interpreter
pub(crate) struct Interpreter<'a> {
    vm: &'a mut VmInstance,
    caller: &'a str,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(vm: &'a mut VmInstance, caller: &'a str) -> Self {
        Self { vm, caller }
    }

    /// Run `function` until it returns to the depth it was entered at
    ///
    /// Frames pushed here are left in place on error; the caller unwinds.
    pub(crate) fn run(&mut self, function: FunctionIndex) -> VmResult<()> {
        let image = Arc::clone(&self.vm.image);
        let exit_depth = self.vm.context.depth();
        let limit = self.vm.config.max_instructions;
        let tracing = self.vm.config.trace_statements;

        self.enter(&image, function)?;
        loop {
            let pc = self.vm.context.statement();
            let current = self.current_function();
            if !self.vm.context.tick(limit) {
                return Err(VmError::Runaway {
                    function: image.function_name(current).to_owned(),
                    statement: pc,
                    limit,
                });
            }

            let Some(&st) = image.statements().get(pc) else {
                return Err(self.fault(&image, format!("statement {pc} out of range")));
            };
            if tracing {
                trace!(
                    domain = %self.vm.domain,
                    function = image.function_name(current),
                    statement = pc,
                    "{st}"
                );
            }
            if let Some(profile) = self.vm.profile_entry(current) {
                profile.statements += 1;
            }

            let step = match self.step(&image, st) {
                Ok(step) => step,
                Err(VmError::Access(err)) => return Err(self.fault(&image, err.to_string())),
                Err(err) => return Err(err),
            };
            match step {
                StepResult::Next => self.vm.context.set_statement(pc + 1),
                StepResult::Jump(target) => self.vm.context.set_statement(target),
                StepResult::Entered => {}
                StepResult::Leave => {
                    let vm = &mut *self.vm;
                    if let Err(err) = vm.context.pop_frame(&mut vm.globals) {
                        return Err(self.fault(&image, err.to_string()));
                    }
                    if self.vm.context.depth() <= exit_depth {
                        return Ok(());
                    }
                    let resume = self.vm.context.statement() + 1;
                    self.vm.context.set_statement(resume);
                }
            }
        }
    }

    fn current_function(&self) -> FunctionIndex {
        self.vm
            .context
            .current_frame()
            .map_or(FunctionIndex::NULL, |frame| frame.function)
    }

    /// Build an execution error for the current statement with a stack trace
    fn fault(&self, image: &ProgramImage, detail: impl Into<String>) -> VmError {
        let mut statement = self.vm.context.statement();
        let trace: Vec<TraceFrame> = self
            .vm
            .context
            .frames()
            .iter()
            .rev()
            .map(|frame| {
                let entry = TraceFrame {
                    function: image.function_name(frame.function).to_owned(),
                    statement,
                };
                statement = frame.caller_statement;
                entry
            })
            .collect();
        let (function, statement) = match trace.first() {
            Some(top) => (top.function.clone(), top.statement),
            None => (self.caller.to_owned(), self.vm.context.statement()),
        };
        VmError::Execution(Box::new(ExecutionError {
            detail: detail.into(),
            statement,
            function,
            trace,
        }))
    }

    // ==================== Operands ====================

    #[inline]
    fn cell(&self, index: usize) -> Result<u32, AccessError> {
        self.vm.globals.cell(index)
    }

    #[inline]
    fn float(&self, index: usize) -> Result<f32, AccessError> {
        self.vm.globals.float(index)
    }

    #[inline]
    fn int(&self, index: usize) -> Result<i32, AccessError> {
        self.vm.globals.int(index)
    }

    #[inline]
    fn vector(&self, index: usize) -> Result<[f32; 3], AccessError> {
        self.vm.globals.vector(index)
    }

    #[inline]
    fn entity(&self, index: usize) -> Result<EntityIndex, AccessError> {
        let raw = self.cell(index)?;
        self.vm.entities.check(raw as i64)
    }

    #[inline]
    fn set_cell(&mut self, index: usize, bits: u32) -> Result<(), AccessError> {
        self.vm.globals.set_cell(index, bits)
    }

    #[inline]
    fn set_float(&mut self, index: usize, value: f32) -> Result<(), AccessError> {
        self.vm.globals.set_float(index, value)
    }

    #[inline]
    fn set_int(&mut self, index: usize, value: i32) -> Result<(), AccessError> {
        self.vm.globals.set_int(index, value)
    }

    #[inline]
    fn set_vector(&mut self, index: usize, value: [f32; 3]) -> Result<(), AccessError> {
        self.vm.globals.set_vector(index, value)
    }

    /// Float-typed truth value
    #[inline]
    fn set_test(&mut self, index: usize, value: bool) -> Result<(), AccessError> {
        self.set_float(index, if value { 1.0 } else { 0.0 })
    }

    fn float_op(&mut self, st: &Statement, op: impl FnOnce(f32, f32) -> f32) -> Result<(), AccessError> {
        let value = op(self.float(st.ga())?, self.float(st.gb())?);
        self.set_float(st.gc(), value)
    }

    fn float_test(&mut self, st: &Statement, op: impl FnOnce(f32, f32) -> bool) -> Result<(), AccessError> {
        let value = op(self.float(st.ga())?, self.float(st.gb())?);
        self.set_test(st.gc(), value)
    }

    fn vector_op(
        &mut self,
        st: &Statement,
        op: impl Fn(f32, f32) -> f32,
    ) -> Result<(), AccessError> {
        let (x, y) = (self.vector(st.ga())?, self.vector(st.gb())?);
        self.set_vector(st.gc(), [op(x[0], y[0]), op(x[1], y[1]), op(x[2], y[2])])
    }

    fn cell_test(&mut self, st: &Statement, op: impl FnOnce(u32, u32) -> bool) -> Result<(), AccessError> {
        let value = op(self.cell(st.ga())?, self.cell(st.gb())?);
        self.set_test(st.gc(), value)
    }

    fn int_op(&mut self, st: &Statement, op: impl FnOnce(i32, i32) -> i32) -> Result<(), AccessError> {
        let value = op(self.int(st.ga())?, self.int(st.gb())?);
        self.set_int(st.gc(), value)
    }

    /// Integer comparisons produce integer 1 or 0
    fn int_test(&mut self, st: &Statement, op: impl FnOnce(i32, i32) -> bool) -> Result<(), AccessError> {
        let value = op(self.int(st.ga())?, self.int(st.gb())?);
        self.set_int(st.gc(), value as i32)
    }

    fn strings_equal(&self, a: usize, b: usize) -> Result<bool, AccessError> {
        let (x, y) = (StringHandle(self.int(a)?), StringHandle(self.int(b)?));
        if x == y {
            return Ok(true);
        }
        Ok(self.vm.strings.resolve(x)? == self.vm.strings.resolve(y)?)
    }

    // ==================== Dispatch ====================

    fn step(&mut self, image: &ProgramImage, st: Statement) -> VmResult<StepResult> {
        let (a, b, c) = (st.ga(), st.gb(), st.gc());
        match st.op {
            Opcode::Done | Opcode::Return => {
                self.ret(a)?;
                return Ok(StepResult::Leave);
            }

            // Float and vector arithmetic
            Opcode::MulF => self.float_op(&st, |x, y| x * y)?,
            Opcode::DivF => self.float_op(&st, |x, y| x / y)?,
            Opcode::AddF => self.float_op(&st, |x, y| x + y)?,
            Opcode::SubF => self.float_op(&st, |x, y| x - y)?,
            Opcode::MulV => {
                let (x, y) = (self.vector(a)?, self.vector(b)?);
                self.set_float(c, x[0] * y[0] + x[1] * y[1] + x[2] * y[2])?;
            }
            Opcode::MulFV => {
                let (s, v) = (self.float(a)?, self.vector(b)?);
                self.set_vector(c, v.map(|x| s * x))?;
            }
            Opcode::MulVF => {
                let (v, s) = (self.vector(a)?, self.float(b)?);
                self.set_vector(c, v.map(|x| x * s))?;
            }
            Opcode::AddV => self.vector_op(&st, |x, y| x + y)?,
            Opcode::SubV => self.vector_op(&st, |x, y| x - y)?,

            Opcode::And => self.float_test(&st, |x, y| x != 0.0 && y != 0.0)?,
            Opcode::Or => self.float_test(&st, |x, y| x != 0.0 || y != 0.0)?,
            Opcode::BitAnd => self.float_op(&st, |x, y| ((x as i32) & (y as i32)) as f32)?,
            Opcode::BitOr => self.float_op(&st, |x, y| ((x as i32) | (y as i32)) as f32)?,

            // Comparisons
            Opcode::EqF => self.float_test(&st, |x, y| x == y)?,
            Opcode::NeF => self.float_test(&st, |x, y| x != y)?,
            Opcode::Le => self.float_test(&st, |x, y| x <= y)?,
            Opcode::Ge => self.float_test(&st, |x, y| x >= y)?,
            Opcode::Lt => self.float_test(&st, |x, y| x < y)?,
            Opcode::Gt => self.float_test(&st, |x, y| x > y)?,
            Opcode::EqV | Opcode::NeV => {
                let equal = self.vector(a)? == self.vector(b)?;
                self.set_test(c, equal == (st.op == Opcode::EqV))?;
            }
            Opcode::EqS | Opcode::NeS => {
                let equal = self.strings_equal(a, b)?;
                self.set_test(c, equal == (st.op == Opcode::EqS))?;
            }
            Opcode::EqE | Opcode::EqFnc => self.cell_test(&st, |x, y| x == y)?,
            Opcode::NeE | Opcode::NeFnc => self.cell_test(&st, |x, y| x != y)?,

            Opcode::NotF => {
                let zero = self.float(a)? == 0.0;
                self.set_test(c, zero)?;
            }
            Opcode::NotV => {
                let zero = self.vector(a)?.iter().all(|&x| x == 0.0);
                self.set_test(c, zero)?;
            }
            Opcode::NotS => {
                let handle = StringHandle(self.int(a)?);
                let empty = handle.is_empty() || self.vm.strings.resolve(handle)?.is_empty();
                self.set_test(c, empty)?;
            }
            Opcode::NotEnt | Opcode::NotFnc => {
                let zero = self.cell(a)? == 0;
                self.set_test(c, zero)?;
            }

            // Entity fields
            Opcode::LoadF
            | Opcode::LoadS
            | Opcode::LoadEnt
            | Opcode::LoadFld
            | Opcode::LoadFnc
            | Opcode::LoadI => self.load_field(&st, 1)?,
            Opcode::LoadV => self.load_field(&st, 3)?,
            Opcode::Address => self.address(&st)?,

            // Stores
            Opcode::StoreF
            | Opcode::StoreS
            | Opcode::StoreEnt
            | Opcode::StoreFld
            | Opcode::StoreFnc
            | Opcode::StoreI => self.copy(a, b, 1)?,
            Opcode::StoreV => self.copy(a, b, 3)?,
            Opcode::StorePF
            | Opcode::StorePS
            | Opcode::StorePEnt
            | Opcode::StorePFld
            | Opcode::StorePFnc
            | Opcode::StorePI => self.store_indirect(&st, 1)?,
            Opcode::StorePV => self.store_indirect(&st, 3)?,

            // Global addressing
            Opcode::GlobalAddress => self.set_cell(c, Pointer::global(st.a).0)?,
            Opcode::LoadPF | Opcode::LoadPI => self.load_indirect(&st, 1)?,
            Opcode::LoadPV => self.load_indirect(&st, 3)?,

            // Control flow
            Opcode::If | Opcode::IfNot => {
                let set = self.cell(a)? != 0;
                if set == (st.op == Opcode::If) {
                    return self.jump(image, &st);
                }
            }
            Opcode::Goto => return self.jump(image, &st),
            Opcode::Call0
            | Opcode::Call1
            | Opcode::Call2
            | Opcode::Call3
            | Opcode::Call4
            | Opcode::Call5
            | Opcode::Call6
            | Opcode::Call7
            | Opcode::Call8 => {
                let argc = st.op.call_argc().unwrap_or_default();
                return self.call(image, a, argc);
            }
            Opcode::State => self.state(image, &st)?,

            // Integers
            Opcode::AddI => self.int_op(&st, i32::wrapping_add)?,
            Opcode::SubI => self.int_op(&st, i32::wrapping_sub)?,
            Opcode::MulI => self.int_op(&st, i32::wrapping_mul)?,
            Opcode::DivI | Opcode::ModI => {
                let (x, y) = (self.int(a)?, self.int(b)?);
                if y == 0 {
                    return Err(self.fault(image, "integer division by zero"));
                }
                let value = if st.op == Opcode::DivI {
                    x.wrapping_div(y)
                } else {
                    x.wrapping_rem(y)
                };
                self.set_int(c, value)?;
            }
            Opcode::BitAndI => self.int_op(&st, |x, y| x & y)?,
            Opcode::BitOrI => self.int_op(&st, |x, y| x | y)?,
            Opcode::BitXorI => self.int_op(&st, |x, y| x ^ y)?,
            Opcode::LShiftI => self.int_op(&st, |x, y| x.wrapping_shl(y as u32))?,
            Opcode::RShiftI => self.int_op(&st, |x, y| x.wrapping_shr(y as u32))?,
            Opcode::EqI => self.int_test(&st, |x, y| x == y)?,
            Opcode::NeI => self.int_test(&st, |x, y| x != y)?,
            Opcode::LtI => self.int_test(&st, |x, y| x < y)?,
            Opcode::LeI => self.int_test(&st, |x, y| x <= y)?,
            Opcode::GtI => self.int_test(&st, |x, y| x > y)?,
            Opcode::GeI => self.int_test(&st, |x, y| x >= y)?,
            Opcode::NotI => {
                let zero = self.int(a)? == 0;
                self.set_int(c, zero as i32)?;
            }
            Opcode::ConvIToF => {
                let value = self.int(a)? as f32;
                self.set_float(c, value)?;
            }
            Opcode::ConvFToI => {
                let value = self.float(a)? as i32;
                self.set_int(c, value)?;
            }
        }
        Ok(StepResult::Next)
    }

    // ==================== Memory ====================

    /// Copy the value at `a` into the return slot; a null operand returns nothing
    fn ret(&mut self, a: usize) -> Result<(), AccessError> {
        if a == OFS_NULL as usize {
            return Ok(());
        }
        let cells = self.vm.globals.as_slice();
        let mut value = [0u32; 3];
        for (n, cell) in value.iter_mut().enumerate() {
            *cell = cells.get(a + n).copied().unwrap_or(0);
        }
        self.vm
            .globals
            .cells_mut(OFS_RETURN as usize, 3)?
            .copy_from_slice(&value);
        Ok(())
    }

    fn copy(&mut self, from: usize, to: usize, n: usize) -> Result<(), AccessError> {
        let mut value = [0u32; 3];
        value[..n].copy_from_slice(self.vm.globals.cells(from, n)?);
        self.vm.globals.cells_mut(to, n)?.copy_from_slice(&value[..n]);
        Ok(())
    }

    fn load_field(&mut self, st: &Statement, n: u32) -> Result<(), AccessError> {
        let entity = self.entity(st.ga())?;
        let field = FieldIndex(self.cell(st.gb())?);
        let vm = &mut *self.vm;
        let value = vm.entities.field(entity, field, n)?;
        vm.globals.cells_mut(st.gc(), n as usize)?.copy_from_slice(value);
        Ok(())
    }

    fn address(&mut self, st: &Statement) -> Result<(), AccessError> {
        let entity = self.entity(st.ga())?;
        if entity.is_world() && !self.vm.config.allow_world_writes {
            return Err(AccessError::WorldEntity);
        }
        let field = FieldIndex(self.cell(st.gb())?);
        let pointer = self.vm.entities.address(entity, field)?;
        self.set_cell(st.gc(), pointer.0)
    }

    fn store_indirect(&mut self, st: &Statement, n: usize) -> Result<(), AccessError> {
        let pointer = Pointer(self.cell(st.gb())?);
        if let Some(PointerTarget::Entity(byte)) = pointer.target()
            && byte < self.vm.entities.record_bytes()
            && !self.vm.config.allow_world_writes
        {
            return Err(AccessError::WorldEntity);
        }
        let mut value = [0u32; 3];
        value[..n].copy_from_slice(self.vm.globals.cells(st.ga(), n)?);
        let vm = &mut *self.vm;
        store_pointer(&mut vm.globals, &mut vm.entities, pointer, &value[..n])
    }

    fn load_indirect(&mut self, st: &Statement, n: usize) -> Result<(), AccessError> {
        let pointer = Pointer(self.cell(st.ga())?);
        let mut value = [0u32; 3];
        value[..n].copy_from_slice(load_pointer(
            &self.vm.globals,
            &self.vm.entities,
            pointer,
            n as u32,
        )?);
        self.vm.globals.cells_mut(st.gc(), n)?.copy_from_slice(&value[..n]);
        Ok(())
    }

    /// self.frame = a; self.think = b; self.nextthink = time + interval
    fn state(&mut self, image: &ProgramImage, st: &Statement) -> VmResult<()> {
        let Some(symbols) = self.vm.state_symbols else {
            return Err(self.fault(
                image,
                "STATE needs the `self` and `time` globals and the `frame`, `think` and `nextthink` fields",
            ));
        };
        let entity = self.entity(symbols.self_global)?;
        if entity.is_world() && !self.vm.config.allow_world_writes {
            return Err(AccessError::WorldEntity.into());
        }
        let frame = self.cell(st.ga())?;
        let think = self.cell(st.gb())?;
        let nextthink = self.float(symbols.time)? + self.vm.config.state_interval;

        let entities = &mut self.vm.entities;
        entities.field_mut(entity, symbols.frame, 1)?[0] = frame;
        entities.field_mut(entity, symbols.think, 1)?[0] = think;
        entities.field_mut(entity, symbols.nextthink, 1)?[0] = nextthink.to_bits();
        Ok(())
    }

    // ==================== Calls ====================

    fn jump(&self, image: &ProgramImage, st: &Statement) -> VmResult<StepResult> {
        let pc = self.vm.context.statement();
        st.jump()
            .and_then(|offset| offset.target(pc))
            .filter(|&target| target < image.statements().len())
            .map(StepResult::Jump)
            .ok_or_else(|| self.fault(image, "jump out of range"))
    }

    fn call(&mut self, image: &ProgramImage, a: usize, argc: usize) -> VmResult<StepResult> {
        let function = FunctionIndex(self.cell(a)?);
        match image.function(function) {
            Some(def) if def.is_builtin() => {
                self.call_builtin(image, function, argc)?;
                Ok(StepResult::Next)
            }
            _ => {
                self.enter(image, function)?;
                Ok(StepResult::Entered)
            }
        }
    }

    /// Push a frame for a program function and jump to its first statement
    fn enter(&mut self, image: &ProgramImage, function: FunctionIndex) -> VmResult<()> {
        if function.is_null() {
            return Err(self.fault(image, "NULL function"));
        }
        let Some(def) = image.function(function) else {
            return Err(self.fault(image, format!("bad function {}", function.0)));
        };
        if def.is_builtin() {
            return Err(self.fault(
                image,
                format!(
                    "builtin `{}` cannot be executed directly",
                    image.function_name(function)
                ),
            ));
        }

        let vm = &mut *self.vm;
        if let Err(err) = vm.context.push_frame(function, def, &mut vm.globals) {
            return Err(self.fault(image, err.to_string()));
        }
        self.vm.context.set_statement(def.first_statement as usize);
        if let Some(profile) = self.vm.profile_entry(function) {
            profile.calls += 1;
        }
        Ok(())
    }

    fn call_builtin(
        &mut self,
        image: &ProgramImage,
        function: FunctionIndex,
        argc: usize,
    ) -> VmResult<()> {
        let caller = self.current_function();
        if let Some(profile) = self.vm.profile_entry(caller) {
            profile.builtin_calls += 1;
        }

        let domain = self.vm.domain;
        let host = match self.vm.builtins.get(function.0 as usize).and_then(Option::as_ref) {
            Some(bound) => bound.callable(domain).map_err(|allowed| {
                self.fault(
                    image,
                    format!(
                        "builtin `{}` is not available to the {domain} VM (allowed: {allowed})",
                        bound.name()
                    ),
                )
            })?,
            None => {
                return Err(self.fault(
                    image,
                    format!("builtin `{}` is not bound", image.function_name(function)),
                ));
            }
        };

        if let Some(profile) = self.vm.profile_entry(function) {
            profile.calls += 1;
        }
        let mut ctx = BuiltinContext::new(&mut *self.vm, function, argc);
        let result = host(&mut ctx);
        match self.vm.context.take_fault() {
            Some(fault) => Err(fault.into_error()),
            None => result,
        }
    }
}
