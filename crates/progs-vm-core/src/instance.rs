//! VM instances
//!
//! An instance is one domain's loaded program together with its memory,
//! strings and execution state. Instances share nothing mutable.

use std::sync::Arc;

use progs_vm_bytecode::{
    EType, FieldIndex, FieldLayout, FunctionIndex, GlobalIndex, ProgramImage,
};
use tracing::{debug, warn};

use crate::builtin::{BoundBuiltin, BuiltinTable};
use crate::config::{InstanceOptions, VmConfig};
use crate::context::{CallState, ExecContext, FunctionProfile};
use crate::domain::Domain;
use crate::error::{AccessError, VmError, VmResult};
use crate::interpreter::Interpreter;
use crate::memory::{EntityMemory, Globals};
use crate::string::{StringHandle, StringTable};
use crate::value::{EntityIndex, Pointer, Value};

/// Symbols `STATE` writes through
#[derive(Debug, Clone, Copy)]
pub(crate) struct StateSymbols {
    pub(crate) self_global: usize,
    pub(crate) time: usize,
    pub(crate) frame: FieldIndex,
    pub(crate) think: FieldIndex,
    pub(crate) nextthink: FieldIndex,
}

impl StateSymbols {
    fn resolve(image: &ProgramImage) -> Option<Self> {
        let field = |name: &str| image.find_field(name).map(|def| FieldIndex(def.offset as u32));
        Some(Self {
            self_global: image.find_global("self")?.offset as usize,
            time: image.find_global("time")?.offset as usize,
            frame: field("frame")?,
            think: field("think")?,
            nextthink: field("nextthink")?,
        })
    }
}

/// One domain's program, memory and execution state
#[derive(Debug)]
pub struct VmInstance {
    pub(crate) domain: Domain,
    pub(crate) image: Arc<ProgramImage>,
    pub(crate) config: VmConfig,
    pub(crate) globals: Globals,
    pub(crate) entities: EntityMemory,
    pub(crate) strings: StringTable,
    pub(crate) builtins: Vec<Option<BoundBuiltin>>,
    pub(crate) context: ExecContext,
    pub(crate) profile: Vec<FunctionProfile>,
    pub(crate) state_symbols: Option<StateSymbols>,
    time_global: Option<usize>,
}

impl VmInstance {
    /// Bring up an instance for a loaded image
    ///
    /// Binds the image's builtin declarations against `builtins` and sizes
    /// entity memory from `options`.
    pub fn new(
        domain: Domain,
        image: ProgramImage,
        builtins: &BuiltinTable,
        config: VmConfig,
        options: &InstanceOptions,
    ) -> VmResult<Self> {
        if options.entity_capacity == 0 {
            return Err(VmError::invalid_options("entity capacity must include the world"));
        }
        let record_cells = options.record_cells.unwrap_or(image.entity_cells());
        if record_cells < image.entity_cells() {
            return Err(VmError::invalid_options(format!(
                "record of {record_cells} cells cannot hold the program's {} field cells",
                image.entity_cells()
            )));
        }

        let entity_bytes =
            u64::from(options.entity_capacity) * u64::from(record_cells.max(1)) * 4;
        if entity_bytes > u64::from(Pointer::GLOBAL_BIT) {
            return Err(VmError::invalid_options(format!(
                "{} entities of {record_cells} cells exceed the entity address space",
                options.entity_capacity
            )));
        }

        let bound = builtins.bind(domain, &image, config.builtin_binding)?;
        let time_global = image
            .find_global("time")
            .filter(|def| def.etype == EType::Float)
            .map(|def| def.offset as usize);

        Ok(Self {
            domain,
            globals: Globals::new(image.initial_globals()),
            entities: EntityMemory::new(options.entity_capacity, record_cells),
            strings: StringTable::new(
                image.strings(),
                config.scratch_strings,
                config.scratch_string_size,
            ),
            builtins: bound,
            context: ExecContext::new(config.max_call_depth, config.local_stack_size),
            profile: vec![FunctionProfile::default(); image.functions().len()],
            state_symbols: StateSymbols::resolve(&image),
            time_global,
            image: Arc::new(image),
            config,
        })
    }

    // ==================== Execution ====================

    /// Run a program function to completion
    ///
    /// `caller` labels the call in diagnostics. On error every frame pushed
    /// by this call is unwound; memory keeps what was written before the
    /// fault. A call made from inside a builtin shares the instruction
    /// budget of the outermost call, and its runtime errors abort the
    /// outermost call even if the builtin discards them.
    pub fn execute(&mut self, function: FunctionIndex, caller: &str) -> VmResult<()> {
        let mark = self.context.begin_call();
        let result = Interpreter::new(self, caller).run(function);
        if let Err(err) = &result {
            self.context.unwind(&mark, &mut self.globals);
            if mark.outermost {
                warn!(
                    domain = %self.domain,
                    caller,
                    function = self.image.function_name(function),
                    error = %err,
                    "call aborted"
                );
            } else {
                self.context.record_fault(err);
            }
        }
        self.context.end_call(&mark, &result);
        result
    }

    /// Run a program function by name
    pub fn execute_by_name(&mut self, name: &str, caller: &str) -> VmResult<()> {
        let function = self
            .find_function(name)
            .ok_or_else(|| AccessError::UnknownSymbol(name.to_owned()))?;
        self.execute(function, caller)
    }

    /// State of the outermost call
    pub fn call_state(&self) -> CallState {
        self.context.state()
    }

    /// Instructions executed by the current (or last) outermost call
    pub fn instructions(&self) -> u64 {
        self.context.instructions()
    }

    // ==================== Symbols ====================

    /// Look up a function by name
    pub fn find_function(&self, name: &str) -> Option<FunctionIndex> {
        self.image.find_function(name)
    }

    /// Look up a global by name
    pub fn find_global(&self, name: &str) -> Option<(GlobalIndex, EType)> {
        self.image
            .find_global(name)
            .map(|def| (def.global(), def.etype))
    }

    /// Look up an entity field by name
    pub fn find_field(&self, name: &str) -> Option<(FieldIndex, EType)> {
        self.image
            .find_field(name)
            .map(|def| (FieldIndex(def.offset as u32), def.etype))
    }

    /// Field layout the host's entity structure must agree with
    pub fn field_layout(&self) -> FieldLayout {
        self.image.field_layout()
    }

    // ==================== Globals and Fields ====================

    /// Read a global as `etype`
    pub fn get_global(&self, index: GlobalIndex, etype: EType) -> VmResult<Value> {
        let cells = self.globals.cells(index.0 as usize, etype.cells() as usize)?;
        Ok(Value::from_cells(etype, cells))
    }

    /// Write a global
    pub fn set_global(&mut self, index: GlobalIndex, value: Value) -> VmResult<()> {
        let (cells, used) = value.to_cells();
        self.globals
            .cells_mut(index.0 as usize, used)?
            .copy_from_slice(&cells[..used]);
        Ok(())
    }

    /// Read a global by name, typed by its definition
    pub fn global_value(&self, name: &str) -> VmResult<Value> {
        let (index, etype) = self
            .find_global(name)
            .ok_or_else(|| AccessError::UnknownSymbol(name.to_owned()))?;
        self.get_global(index, etype)
    }

    /// Write a global by name
    pub fn set_global_value(&mut self, name: &str, value: Value) -> VmResult<()> {
        let (index, _) = self
            .find_global(name)
            .ok_or_else(|| AccessError::UnknownSymbol(name.to_owned()))?;
        self.set_global(index, value)
    }

    /// Read an entity field as `etype`
    pub fn get_field(&self, entity: EntityIndex, field: FieldIndex, etype: EType) -> VmResult<Value> {
        let cells = self.entities.field(entity, field, etype.cells() as u32)?;
        Ok(Value::from_cells(etype, cells))
    }

    /// Write an entity field
    pub fn set_field(&mut self, entity: EntityIndex, field: FieldIndex, value: Value) -> VmResult<()> {
        let (cells, used) = value.to_cells();
        self.entities
            .field_mut(entity, field, used as u32)?
            .copy_from_slice(&cells[..used]);
        Ok(())
    }

    /// Read an entity field by name
    pub fn field_value(&self, entity: EntityIndex, name: &str) -> VmResult<Value> {
        let (field, etype) = self
            .find_field(name)
            .ok_or_else(|| AccessError::UnknownSymbol(name.to_owned()))?;
        self.get_field(entity, field, etype)
    }

    /// Write an entity field by name
    pub fn set_field_value(&mut self, entity: EntityIndex, name: &str, value: Value) -> VmResult<()> {
        let (field, _) = self
            .find_field(name)
            .ok_or_else(|| AccessError::UnknownSymbol(name.to_owned()))?;
        self.set_field(entity, field, value)
    }

    // ==================== Strings ====================

    /// Bytes of a string handle
    pub fn resolve_string(&self, handle: StringHandle) -> VmResult<&[u8]> {
        Ok(self.strings.resolve(handle)?)
    }

    /// Copy bytes into a scratch string
    pub fn new_string(&mut self, bytes: impl AsRef<[u8]>) -> StringHandle {
        self.strings.new_scratch(bytes.as_ref())
    }

    /// Copy bytes into a persistent string
    pub fn alloc_string(&mut self, bytes: impl AsRef<[u8]>) -> StringHandle {
        self.strings.alloc_persistent(bytes.as_ref())
    }

    /// Release a persistent string
    pub fn free_string(&mut self, handle: StringHandle) -> VmResult<()> {
        Ok(self.strings.free_persistent(handle)?)
    }

    // ==================== Entities ====================

    fn now(&self) -> f32 {
        self.time_global
            .and_then(|index| self.globals.float(index).ok())
            .unwrap_or(0.0)
    }

    /// Allocate an entity at the current world time
    pub fn spawn(&mut self) -> VmResult<EntityIndex> {
        let now = self.now();
        Ok(self.entities.alloc(now)?)
    }

    /// Free an entity at the current world time
    pub fn remove(&mut self, entity: EntityIndex) -> VmResult<()> {
        let now = self.now();
        Ok(self.entities.free(entity, now)?)
    }

    /// Named, non-zero fields of an entity, one per line
    pub fn describe_entity(&self, entity: EntityIndex) -> VmResult<String> {
        let entity = self.entities.check(entity.0 as i64)?;
        let mut out = format!("{entity}");
        if self.entities.is_free(entity) {
            out.push_str(" (free)");
        }
        for (name, etype, field) in self.image.field_layout().iter() {
            let value = self.get_field(entity, field, etype)?;
            if value.is_zero() {
                continue;
            }
            let shown = match value {
                Value::String(handle) => {
                    format!("\"{}\"", self.strings.resolve_lossy(handle).unwrap_or_default())
                }
                Value::Function(function) => format!("{}()", self.image.function_name(function)),
                other => other.to_string(),
            };
            out.push_str(&format!("\n  {name}: {shown}"));
        }
        Ok(out)
    }

    // ==================== Profiling ====================

    /// Counters of one function
    pub fn profile(&self, function: FunctionIndex) -> FunctionProfile {
        self.profile
            .get(function.0 as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Functions that ran, with their names and counters
    pub fn profiles(&self) -> impl Iterator<Item = (&str, FunctionProfile)> {
        self.profile
            .iter()
            .enumerate()
            .filter(|(_, p)| p.calls > 0 || p.statements > 0)
            .map(|(index, p)| (self.image.function_name(FunctionIndex(index as u32)), *p))
    }

    /// Zero every profile counter
    pub fn reset_profile(&mut self) {
        self.profile.fill(FunctionProfile::default());
    }

    pub(crate) fn profile_entry(&mut self, function: FunctionIndex) -> Option<&mut FunctionProfile> {
        self.profile.get_mut(function.0 as usize)
    }

    // ==================== Lifecycle ====================

    /// Restore initial globals and drop entities and runtime strings
    pub fn reset(&mut self) -> VmResult<()> {
        if self.context.is_running() {
            return Err(VmError::Busy(self.domain));
        }
        self.globals.reset(self.image.initial_globals());
        self.entities.clear();
        self.strings.reset();
        self.context = ExecContext::new(self.config.max_call_depth, self.config.local_stack_size);
        self.reset_profile();
        debug!(domain = %self.domain, "instance reset");
        Ok(())
    }

    // ==================== Accessors ====================

    /// Domain of this instance
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// The loaded program
    pub fn image(&self) -> &ProgramImage {
        &self.image
    }

    /// Configuration the instance was created with
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Global cells
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// Global cells, mutably
    pub fn globals_mut(&mut self) -> &mut Globals {
        &mut self.globals
    }

    /// Entity memory
    pub fn entities(&self) -> &EntityMemory {
        &self.entities
    }

    /// Entity memory, mutably
    pub fn entities_mut(&mut self) -> &mut EntityMemory {
        &mut self.entities
    }

    /// String table
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// String table, mutably
    pub fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }

    /// Execution state
    pub fn context(&self) -> &ExecContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progs_vm_bytecode::ProgramBuilder;

    fn program() -> ProgramImage {
        let mut b = ProgramBuilder::new();
        b.global("time", EType::Float);
        b.global("score", EType::Float);
        b.field("health", EType::Float);
        b.field("origin", EType::Vector);
        b.field("classname", EType::String);
        b.build().unwrap()
    }

    fn instance(options: &InstanceOptions) -> VmResult<VmInstance> {
        VmInstance::new(
            Domain::Client,
            program(),
            &BuiltinTable::new(),
            VmConfig::default(),
            options,
        )
    }

    #[test]
    fn test_instance_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<VmInstance>();
    }

    #[test]
    fn test_record_width_must_fit_fields() {
        let options = InstanceOptions {
            record_cells: Some(2),
            ..InstanceOptions::with_capacity(4)
        };
        assert!(matches!(instance(&options), Err(VmError::InvalidOptions(_))));

        let wider = InstanceOptions {
            record_cells: Some(32),
            ..InstanceOptions::with_capacity(4)
        };
        let vm = instance(&wider).unwrap();
        assert_eq!(vm.entities().record_cells(), 32);
    }

    #[test]
    fn test_entity_memory_must_fit_pointer_range() {
        let options = InstanceOptions {
            record_cells: Some(1 << 10),
            ..InstanceOptions::with_capacity(1 << 20)
        };
        assert!(matches!(instance(&options), Err(VmError::InvalidOptions(_))));
    }

    #[test]
    fn test_named_globals_and_fields() {
        let mut vm = instance(&InstanceOptions::with_capacity(4)).unwrap();
        vm.set_global_value("score", Value::Float(12.5)).unwrap();
        assert_eq!(vm.global_value("score").unwrap(), Value::Float(12.5));
        assert!(matches!(
            vm.global_value("missing"),
            Err(VmError::Access(AccessError::UnknownSymbol(_)))
        ));

        let ent = vm.spawn().unwrap();
        vm.set_field_value(ent, "origin", Value::Vector([1.0, 2.0, 3.0]))
            .unwrap();
        assert_eq!(
            vm.field_value(ent, "origin").unwrap(),
            Value::Vector([1.0, 2.0, 3.0])
        );
    }

    #[test]
    fn test_describe_entity() {
        let mut vm = instance(&InstanceOptions::with_capacity(4)).unwrap();
        let ent = vm.spawn().unwrap();
        let name = vm.alloc_string("player");
        vm.set_field_value(ent, "classname", Value::String(name)).unwrap();
        vm.set_field_value(ent, "health", Value::Float(100.0)).unwrap();

        let text = vm.describe_entity(ent).unwrap();
        assert_eq!(text, "entity 1\n  health: 100\n  classname: \"player\"");
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut vm = instance(&InstanceOptions::with_capacity(4)).unwrap();
        vm.set_global_value("score", Value::Float(3.0)).unwrap();
        let ent = vm.spawn().unwrap();
        let handle = vm.alloc_string("kept");

        vm.reset().unwrap();
        assert_eq!(vm.global_value("score").unwrap(), Value::Float(0.0));
        assert!(vm.entities().is_free(ent));
        assert!(vm.resolve_string(handle).is_err());
        assert_eq!(vm.call_state(), CallState::Ready);
    }
}
