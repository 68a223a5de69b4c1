//! Host builtins
//!
//! Programs declare builtins by name (function entries with a negative
//! first statement). The host registers an implementation per name together
//! with the domains allowed to call it, and each instance binds its
//! declarations against the table once, at bring-up.

use std::sync::Arc;

use progs_vm_bytecode::{FunctionIndex, OFS_RETURN, ProgramImage, ofs_parm};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::BuiltinBinding;
use crate::domain::{Domain, DomainMask};
use crate::error::{AccessError, VmError, VmResult};
use crate::instance::VmInstance;
use crate::string::StringHandle;
use crate::value::EntityIndex;

/// Maximum number of registered builtins
pub const MAX_BUILTINS: usize = 1024;

/// Host function behind a builtin
pub type BuiltinFn = Arc<dyn Fn(&mut BuiltinContext<'_>) -> VmResult<()> + Send + Sync>;

/// A registered builtin
#[derive(Clone)]
pub struct BuiltinEntry {
    name: Box<str>,
    domains: DomainMask,
    function: BuiltinFn,
}

impl BuiltinEntry {
    /// Builtin name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Domains allowed to call it
    pub fn domains(&self) -> DomainMask {
        self.domains
    }
}

impl std::fmt::Debug for BuiltinEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinEntry")
            .field("name", &self.name)
            .field("domains", &self.domains)
            .finish_non_exhaustive()
    }
}

/// Name-indexed builtin registry shared by all instances
#[derive(Debug, Clone, Default)]
pub struct BuiltinTable {
    entries: Vec<BuiltinEntry>,
    by_name: FxHashMap<Box<str>, usize>,
}

impl BuiltinTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builtin under `name` for the domains in `domains`
    pub fn register<F>(&mut self, name: &str, domains: DomainMask, function: F) -> VmResult<()>
    where
        F: Fn(&mut BuiltinContext<'_>) -> VmResult<()> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(VmError::registration("builtin name is empty"));
        }
        if domains.is_empty() {
            return Err(VmError::registration(format!(
                "builtin `{name}` is not allowed in any domain"
            )));
        }
        if self.by_name.contains_key(name) {
            return Err(VmError::registration(format!(
                "builtin `{name}` is already registered"
            )));
        }
        if self.entries.len() >= MAX_BUILTINS {
            return Err(VmError::registration(format!(
                "builtin table is full ({MAX_BUILTINS} entries)"
            )));
        }

        self.by_name.insert(name.into(), self.entries.len());
        self.entries.push(BuiltinEntry {
            name: name.into(),
            domains,
            function: Arc::new(function),
        });
        Ok(())
    }

    /// Look up a builtin by name
    pub fn get(&self, name: &str) -> Option<&BuiltinEntry> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    /// Number of registered builtins
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over registered builtins
    pub fn iter(&self) -> impl Iterator<Item = &BuiltinEntry> {
        self.entries.iter()
    }

    /// Resolve every builtin declared by `image` for `domain`
    ///
    /// The result is indexed by function index.
    pub(crate) fn bind(
        &self,
        domain: Domain,
        image: &ProgramImage,
        policy: BuiltinBinding,
    ) -> VmResult<Vec<Option<BoundBuiltin>>> {
        let mut bound = vec![None; image.functions().len()];
        let mut traps = 0usize;
        for (index, name) in image.builtins() {
            let entry = self
                .get(name)
                .ok_or_else(|| VmError::unresolved(domain, name, "no such builtin"))?;
            let binding = if entry.domains.contains(domain) {
                BoundBuiltin::Host(entry.clone())
            } else {
                match policy {
                    BuiltinBinding::Strict => {
                        return Err(VmError::unresolved(
                            domain,
                            name,
                            format!("only available to {}", entry.domains),
                        ));
                    }
                    BuiltinBinding::Deferred => {
                        traps += 1;
                        BoundBuiltin::Trap {
                            name: entry.name.clone(),
                            domains: entry.domains,
                        }
                    }
                }
            };
            bound[index.0 as usize] = Some(binding);
        }
        debug!(
            %domain,
            builtins = bound.iter().flatten().count(),
            traps,
            "bound builtins"
        );
        Ok(bound)
    }
}

/// A program builtin declaration after binding
#[derive(Debug, Clone)]
pub(crate) enum BoundBuiltin {
    /// Callable host function
    Host(BuiltinEntry),
    /// Registered, but not for this domain
    Trap { name: Box<str>, domains: DomainMask },
}

impl BoundBuiltin {
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Host(entry) => entry.name(),
            Self::Trap { name, .. } => name,
        }
    }

    /// The host function, if `domain` may call it
    pub(crate) fn callable(&self, domain: Domain) -> Result<BuiltinFn, DomainMask> {
        match self {
            Self::Host(entry) if entry.domains.contains(domain) => Ok(Arc::clone(&entry.function)),
            Self::Host(entry) => Err(entry.domains),
            Self::Trap { domains, .. } => Err(*domains),
        }
    }
}

/// What a builtin sees of the running VM
///
/// Parameters are read from the calling convention's parameter slots and the
/// result goes to the return slot.
pub struct BuiltinContext<'vm> {
    vm: &'vm mut VmInstance,
    argc: usize,
    function: FunctionIndex,
}

impl<'vm> BuiltinContext<'vm> {
    pub(crate) fn new(vm: &'vm mut VmInstance, function: FunctionIndex, argc: usize) -> Self {
        Self { vm, argc, function }
    }

    /// Number of arguments passed by the call
    #[inline]
    pub fn argc(&self) -> usize {
        self.argc
    }

    /// Domain of the calling instance
    pub fn domain(&self) -> Domain {
        self.vm.domain()
    }

    /// Name the program declared this builtin under
    pub fn name(&self) -> &str {
        self.vm.image().function_name(self.function)
    }

    /// The calling instance
    pub fn vm(&self) -> &VmInstance {
        self.vm
    }

    /// The calling instance, mutably
    pub fn vm_mut(&mut self) -> &mut VmInstance {
        self.vm
    }

    fn parm(&self, index: usize) -> Result<usize, AccessError> {
        if index >= self.argc {
            return Err(AccessError::Argument {
                index,
                argc: self.argc,
            });
        }
        Ok(ofs_parm(index) as usize)
    }

    // ==================== Arguments ====================

    /// Argument as float
    pub fn arg_float(&self, index: usize) -> VmResult<f32> {
        Ok(self.vm.globals.float(self.parm(index)?)?)
    }

    /// Argument as integer
    pub fn arg_int(&self, index: usize) -> VmResult<i32> {
        Ok(self.vm.globals.int(self.parm(index)?)?)
    }

    /// Argument as vector
    pub fn arg_vector(&self, index: usize) -> VmResult<[f32; 3]> {
        Ok(self.vm.globals.vector(self.parm(index)?)?)
    }

    /// Argument as a raw string handle
    pub fn arg_string_handle(&self, index: usize) -> VmResult<StringHandle> {
        Ok(StringHandle(self.vm.globals.int(self.parm(index)?)?))
    }

    /// Argument as bytes of the string it refers to
    pub fn arg_bytes(&self, index: usize) -> VmResult<&[u8]> {
        let handle = self.arg_string_handle(index)?;
        Ok(self.vm.strings.resolve(handle)?)
    }

    /// Argument as text, with invalid UTF-8 replaced
    pub fn arg_string(&self, index: usize) -> VmResult<String> {
        let handle = self.arg_string_handle(index)?;
        Ok(self.vm.strings.resolve_lossy(handle)?)
    }

    /// Argument as a validated entity number
    pub fn arg_entity(&self, index: usize) -> VmResult<EntityIndex> {
        let raw = self.vm.globals.int(self.parm(index)?)?;
        Ok(self.vm.entities.check(raw as i64)?)
    }

    /// Argument as a validated function index
    pub fn arg_function(&self, index: usize) -> VmResult<FunctionIndex> {
        let raw = self.vm.globals.cell(self.parm(index)?)?;
        if raw as usize >= self.vm.image().functions().len() {
            return Err(AccessError::Function(raw).into());
        }
        Ok(FunctionIndex(raw))
    }

    // ==================== Return Value ====================

    fn write_return(&mut self, cells: [u32; 3]) {
        // The reserved area is guaranteed by image validation
        if let Ok(slot) = self.vm.globals.cells_mut(OFS_RETURN as usize, 3) {
            slot.copy_from_slice(&cells);
        }
    }

    /// Return a float
    pub fn return_float(&mut self, value: f32) {
        self.write_return([value.to_bits(), 0, 0]);
    }

    /// Return an integer
    pub fn return_int(&mut self, value: i32) {
        self.write_return([value as u32, 0, 0]);
    }

    /// Return a vector
    pub fn return_vector(&mut self, value: [f32; 3]) {
        self.write_return(value.map(f32::to_bits));
    }

    /// Return an entity
    pub fn return_entity(&mut self, entity: EntityIndex) {
        self.write_return([entity.0, 0, 0]);
    }

    /// Return a function
    pub fn return_function(&mut self, function: FunctionIndex) {
        self.write_return([function.0, 0, 0]);
    }

    /// Return an existing string handle
    pub fn return_string_handle(&mut self, handle: StringHandle) {
        self.write_return([handle.0 as u32, 0, 0]);
    }

    /// Copy `text` into a scratch string and return it
    pub fn return_string(&mut self, text: impl AsRef<[u8]>) -> StringHandle {
        let handle = self.new_string(text);
        self.return_string_handle(handle);
        handle
    }

    // ==================== Strings ====================

    /// Copy bytes into a scratch string
    pub fn new_string(&mut self, bytes: impl AsRef<[u8]>) -> StringHandle {
        self.vm.strings.new_scratch(bytes.as_ref())
    }

    /// Bytes of any string handle
    pub fn resolve_string(&self, handle: StringHandle) -> VmResult<&[u8]> {
        Ok(self.vm.strings.resolve(handle)?)
    }

    // ==================== Control ====================

    /// Terminate the current top-level call with `message`
    pub fn abort<T>(&self, message: impl Into<String>) -> VmResult<T> {
        Err(VmError::abort(message))
    }

    /// Run a program function on the calling instance
    ///
    /// The nested call shares the instruction budget of the outermost call.
    /// Parameter slots and the return slot are shared with the caller, so
    /// read arguments before calling. A runtime error of the nested call
    /// aborts the whole outermost call when the builtin returns, whether or
    /// not the builtin passes it on; further calls fail with the same error.
    pub fn call(&mut self, function: FunctionIndex) -> VmResult<()> {
        if let Some(fault) = self.vm.context.pending_fault() {
            return Err(fault.clone().into_error());
        }
        let label = self.vm.image().function_name(self.function).to_owned();
        self.vm.execute(function, &label)
    }
}
