//! VM error types

use progs_vm_bytecode::ProgramFormatError;
use thiserror::Error;

use crate::domain::Domain;

/// Out-of-range memory, string or argument access
///
/// Raised by the bounds-checked accessors. The interpreter wraps it into
/// [`VmError::Execution`] with the offending statement attached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    /// Global cell outside the global array
    #[error("global {index} out of range ({len} cells)")]
    Global {
        /// Requested cell
        index: usize,
        /// Global array length
        len: usize,
    },

    /// Entity number outside entity memory
    #[error("entity {entity} out of range (capacity {capacity})")]
    Entity {
        /// Requested entity number
        entity: i64,
        /// Entity capacity
        capacity: u32,
    },

    /// Entity byte handle that is not a record boundary
    #[error("bad entity handle {0}")]
    EntityHandle(i32),

    /// Field offset outside the entity record
    #[error("field {field} (+{cells}) out of range ({record_cells} cells per entity)")]
    Field {
        /// Field cell offset
        field: u32,
        /// Cells accessed
        cells: u32,
        /// Record width
        record_cells: u32,
    },

    /// Pointer that addresses neither a global nor an entity field
    #[error("bad pointer {0:#010x}")]
    Pointer(u32),

    /// String handle outside every string range
    #[error("bad string handle {0}")]
    String(i32),

    /// Builtin argument beyond the call's argument count
    #[error("argument {index} out of range ({argc} passed)")]
    Argument {
        /// Requested argument
        index: usize,
        /// Arguments passed by the call
        argc: usize,
    },

    /// Function handle outside the function table
    #[error("bad function {0}")]
    Function(u32),

    /// Entity memory has no free record
    #[error("no free entity ({capacity} in use)")]
    EntitiesExhausted {
        /// Entity capacity
        capacity: u32,
    },

    /// Attempt to free or write the world entity
    #[error("world entity is read-only")]
    WorldEntity,

    /// Name not found in the program's definition tables
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
}

/// A frame of an execution stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name
    pub function: String,
    /// Statement being executed in that function
    pub statement: usize,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} : statement {}", self.function, self.statement)
    }
}

/// Runtime fault inside program code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    /// What went wrong
    pub detail: String,
    /// Statement index where the fault happened
    pub statement: usize,
    /// Function the statement belongs to
    pub function: String,
    /// Innermost frame first
    pub trace: Vec<TraceFrame>,
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (statement {} in {})",
            self.detail, self.statement, self.function
        )
    }
}

/// VM errors
#[derive(Debug, Error)]
pub enum VmError {
    /// Image rejected by the loader
    #[error("program format error: {0}")]
    ProgramFormat(#[from] ProgramFormatError),

    /// A builtin declared by the program could not be bound
    #[error("{domain} program: unresolved builtin `{name}`: {reason}")]
    UnresolvedBuiltin {
        /// Domain being brought up
        domain: Domain,
        /// Builtin name declared by the program
        name: String,
        /// Why binding failed
        reason: String,
    },

    /// Runtime fault inside program code
    #[error("execution error: {0}")]
    Execution(Box<ExecutionError>),

    /// Instruction ceiling exceeded
    #[error("runaway loop: {limit} instructions exceeded in {function} at statement {statement}")]
    Runaway {
        /// Function running when the ceiling was hit
        function: String,
        /// Statement running when the ceiling was hit
        statement: usize,
        /// Configured ceiling
        limit: u64,
    },

    /// A builtin terminated the call
    #[error("host requested abort: {0}")]
    HostRequestedAbort(String),

    /// The request addressed an instance that is not active
    #[error("{requested} VM is not active (active: {})", .active.map(Domain::name).unwrap_or("none"))]
    WrongVmActive {
        /// Domain the request addressed
        requested: Domain,
        /// Currently active domain
        active: Option<Domain>,
    },

    /// No instance is bound as active
    #[error("no VM is active")]
    NoActiveVm,

    /// The instance is executing and cannot be reset
    #[error("{0} VM is executing")]
    Busy(Domain),

    /// No instance exists for the domain
    #[error("no {0} VM instance")]
    NoInstance(Domain),

    /// An instance already exists for the domain
    #[error("{0} VM instance already exists")]
    InstanceExists(Domain),

    /// Builtin table registration failed
    #[error("builtin registration failed: {0}")]
    Registration(String),

    /// Instance options cannot be satisfied
    #[error("invalid instance options: {0}")]
    InvalidOptions(String),

    /// Bounds-checked access failed outside of program execution
    #[error("access error: {0}")]
    Access(#[from] AccessError),
}

impl VmError {
    /// Create an unresolved builtin error
    pub fn unresolved(domain: Domain, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnresolvedBuiltin {
            domain,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a registration error
    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    /// Create a host abort
    pub fn abort(msg: impl Into<String>) -> Self {
        Self::HostRequestedAbort(msg.into())
    }

    /// Create an invalid options error
    pub fn invalid_options(msg: impl Into<String>) -> Self {
        Self::InvalidOptions(msg.into())
    }

    /// The execution error, if this is one
    pub fn as_execution(&self) -> Option<&ExecutionError> {
        match self {
            Self::Execution(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the error aborted a running call
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::Execution(_) | Self::Runaway { .. } | Self::HostRequestedAbort(_)
        )
    }
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_display() {
        let err = VmError::Execution(Box::new(ExecutionError {
            detail: "NULL function".into(),
            statement: 12,
            function: "main".into(),
            trace: Vec::new(),
        }));
        assert_eq!(
            err.to_string(),
            "execution error: NULL function (statement 12 in main)"
        );
        assert!(err.is_runtime());
    }

    #[test]
    fn test_wrong_vm_active_display() {
        let err = VmError::WrongVmActive {
            requested: Domain::Client,
            active: None,
        };
        assert_eq!(err.to_string(), "client VM is not active (active: none)");
        assert!(!err.is_runtime());
    }

    #[test]
    fn test_access_converts() {
        let err: VmError = AccessError::String(-99).into();
        assert!(matches!(err, VmError::Access(AccessError::String(-99))));
    }
}
