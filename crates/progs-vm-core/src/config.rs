//! VM configuration

use serde::{Deserialize, Serialize};

/// Default instruction ceiling per outermost call
pub const DEFAULT_MAX_INSTRUCTIONS: u64 = 10_000_000;

/// Default maximum call depth
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

/// Default local stack size in cells
pub const DEFAULT_LOCAL_STACK: usize = 16384;

/// When wrong-domain builtins are rejected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinBinding {
    /// Fail instance bring-up
    #[default]
    Strict,
    /// Bind a trap that fails the call when the builtin is invoked
    Deferred,
}

/// Per-registry VM configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Instructions one outermost call may execute, nested calls included
    pub max_instructions: u64,
    /// Maximum call depth
    pub max_call_depth: usize,
    /// Cells available for saved locals windows
    pub local_stack_size: usize,
    /// Number of rotating scratch string buffers
    pub scratch_strings: usize,
    /// Size of each scratch buffer in bytes
    pub scratch_string_size: usize,
    /// Delay `STATE` adds to `time` for `nextthink`
    pub state_interval: f32,
    /// Allow `ADDRESS` on the world entity
    pub allow_world_writes: bool,
    /// Wrong-domain builtin policy
    pub builtin_binding: BuiltinBinding,
    /// Log every executed statement at trace level
    pub trace_statements: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            local_stack_size: DEFAULT_LOCAL_STACK,
            scratch_strings: 16,
            scratch_string_size: 4096,
            state_interval: 0.1,
            allow_world_writes: false,
            builtin_binding: BuiltinBinding::Strict,
            trace_statements: false,
        }
    }
}

/// Symbols and checksum a host requires from a program
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Definition checksum the host was built against
    pub expected_checksum: Option<u32>,
    /// Functions the host calls by name
    pub required_functions: Vec<String>,
    /// Entity fields the host reads or writes
    pub required_fields: Vec<String>,
    /// Globals the host reads or writes
    pub required_globals: Vec<String>,
}

/// Memory sizing and load policy for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceOptions {
    /// Number of entity records, world included
    pub entity_capacity: u32,
    /// Record width in cells; the program's field area when unset
    pub record_cells: Option<u32>,
    /// Load-time checks
    pub load: LoadOptions,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            entity_capacity: 1024,
            record_cells: None,
            load: LoadOptions::default(),
        }
    }
}

impl InstanceOptions {
    /// Options with the given entity capacity
    pub fn with_capacity(entity_capacity: u32) -> Self {
        Self {
            entity_capacity,
            ..Self::default()
        }
    }
}
