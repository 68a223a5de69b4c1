//! VM registry - the host's entry point
//!
//! The registry owns at most one instance per domain, the builtin table they
//! bind against and the active domain. Hosts switch the active domain when
//! control moves between server, client and UI logic.

use std::sync::Arc;

use progs_vm_bytecode::FunctionIndex;
use tracing::debug;

use crate::builtin::{BuiltinContext, BuiltinTable};
use crate::config::{InstanceOptions, VmConfig};
use crate::domain::{Domain, DomainMask};
use crate::error::{VmError, VmResult};
use crate::instance::VmInstance;
use crate::loader::load_program;

/// Owner of the per-domain VM instances
#[derive(Debug, Default)]
pub struct VmRegistry {
    config: VmConfig,
    builtins: Arc<BuiltinTable>,
    instances: [Option<VmInstance>; 3],
    active: Option<Domain>,
}

impl VmRegistry {
    /// Create a registry with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with custom configuration
    pub fn with_config(config: VmConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Configuration new instances are created with
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    // ==================== Builtins ====================

    /// Register a host builtin
    ///
    /// Only instances created afterwards can bind it.
    pub fn register_builtin<F>(&mut self, name: &str, domains: DomainMask, function: F) -> VmResult<()>
    where
        F: Fn(&mut BuiltinContext<'_>) -> VmResult<()> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.builtins).register(name, domains, function)
    }

    /// The shared builtin table
    pub fn builtins(&self) -> &BuiltinTable {
        &self.builtins
    }

    // ==================== Instances ====================

    /// Load `bytes` and bring up the instance for `domain`
    pub fn create(
        &mut self,
        domain: Domain,
        bytes: &[u8],
        options: &InstanceOptions,
    ) -> VmResult<&mut VmInstance> {
        let slot = &mut self.instances[domain.slot()];
        if slot.is_some() {
            return Err(VmError::InstanceExists(domain));
        }

        let image = load_program(domain, bytes, &options.load)?;
        let instance = VmInstance::new(domain, image, &self.builtins, self.config.clone(), options)?;
        debug!(
            %domain,
            entity_capacity = instance.entities().capacity(),
            record_cells = instance.entities().record_cells(),
            "instance created"
        );
        Ok(slot.insert(instance))
    }

    /// Release the instance for `domain`
    pub fn destroy(&mut self, domain: Domain) -> VmResult<VmInstance> {
        let instance = self.instances[domain.slot()]
            .take()
            .ok_or(VmError::NoInstance(domain))?;
        if self.active == Some(domain) {
            self.active = None;
        }
        debug!(%domain, "instance destroyed");
        Ok(instance)
    }

    /// Restore the instance for `domain` to its freshly loaded state
    pub fn reset(&mut self, domain: Domain) -> VmResult<()> {
        self.get_mut(domain)?.reset()
    }

    /// Instance for `domain`
    pub fn get(&self, domain: Domain) -> VmResult<&VmInstance> {
        self.instances[domain.slot()]
            .as_ref()
            .ok_or(VmError::NoInstance(domain))
    }

    /// Instance for `domain`, mutably
    pub fn get_mut(&mut self, domain: Domain) -> VmResult<&mut VmInstance> {
        self.instances[domain.slot()]
            .as_mut()
            .ok_or(VmError::NoInstance(domain))
    }

    /// Whether an instance exists for `domain`
    pub fn contains(&self, domain: Domain) -> bool {
        self.instances[domain.slot()].is_some()
    }

    // ==================== Activation ====================

    /// Make `domain` the active instance, returning the previous one
    pub fn bind(&mut self, domain: Domain) -> VmResult<Option<Domain>> {
        if !self.contains(domain) {
            return Err(VmError::NoInstance(domain));
        }
        Ok(self.active.replace(domain))
    }

    /// Clear the active instance, returning it
    pub fn unbind(&mut self) -> Option<Domain> {
        self.active.take()
    }

    /// Active domain
    pub fn active(&self) -> Option<Domain> {
        self.active
    }

    /// Active instance
    pub fn active_instance(&self) -> VmResult<&VmInstance> {
        let domain = self.active.ok_or(VmError::NoActiveVm)?;
        self.get(domain)
    }

    /// Active instance, mutably
    pub fn active_instance_mut(&mut self) -> VmResult<&mut VmInstance> {
        let domain = self.active.ok_or(VmError::NoActiveVm)?;
        self.get_mut(domain)
    }

    // ==================== Execution ====================

    /// Run a function on the active instance
    pub fn execute(&mut self, function: FunctionIndex, caller: &str) -> VmResult<()> {
        self.active_instance_mut()?.execute(function, caller)
    }

    /// Run a function by name on the active instance
    pub fn execute_by_name(&mut self, name: &str, caller: &str) -> VmResult<()> {
        self.active_instance_mut()?.execute_by_name(name, caller)
    }

    /// Run a function on `domain`, which must be the active instance
    pub fn execute_in(&mut self, domain: Domain, function: FunctionIndex, caller: &str) -> VmResult<()> {
        if self.active != Some(domain) {
            return Err(VmError::WrongVmActive {
                requested: domain,
                active: self.active,
            });
        }
        self.get_mut(domain)?.execute(function, caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progs_vm_bytecode::{EType, GlobalIndex, ProgramBuilder};

    fn program() -> Vec<u8> {
        let mut b = ProgramBuilder::new();
        b.global("time", EType::Float);
        b.function("main", &[], &[]);
        b.ret(GlobalIndex::NONE);
        b.to_bytes()
    }

    #[test]
    fn test_create_twice_fails() {
        let mut registry = VmRegistry::new();
        registry
            .create(Domain::Server, &program(), &InstanceOptions::default())
            .unwrap();
        assert!(matches!(
            registry.create(Domain::Server, &program(), &InstanceOptions::default()),
            Err(VmError::InstanceExists(Domain::Server))
        ));
    }

    #[test]
    fn test_destroy_clears_active() {
        let mut registry = VmRegistry::new();
        registry
            .create(Domain::Ui, &program(), &InstanceOptions::default())
            .unwrap();
        assert_eq!(registry.bind(Domain::Ui).unwrap(), None);
        registry.destroy(Domain::Ui).unwrap();
        assert_eq!(registry.active(), None);
        assert!(matches!(registry.execute_by_name("main", "test"), Err(VmError::NoActiveVm)));
        assert!(matches!(registry.bind(Domain::Ui), Err(VmError::NoInstance(Domain::Ui))));
    }

    #[test]
    fn test_registry_config_reaches_instances() {
        let config = VmConfig {
            max_instructions: 42,
            ..VmConfig::default()
        };
        let mut registry = VmRegistry::with_config(config);
        let vm = registry
            .create(Domain::Client, &program(), &InstanceOptions::default())
            .unwrap();
        assert_eq!(vm.config().max_instructions, 42);
    }
}
