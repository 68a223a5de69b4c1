//! # Progs VM Core
//!
//! Execution engine for compiled game-logic programs, run by three
//! independent domains: server, client and UI.
//!
//! ## Design Principles
//!
//! - **Flat memory**: globals and entity records are arrays of 4-byte cells
//! - **Checked access**: every dereference is bounds-checked and surfaces as
//!   an error, never an out-of-range read
//! - **Bounded**: an instruction ceiling per outermost call stops runaway
//!   programs, nested builtin re-entry included
//! - **Explicit instances**: the active domain is registry state, not a
//!   process-wide global

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod builtin;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod instance;
mod interpreter;
pub mod loader;
pub mod memory;
pub mod runtime;
pub mod string;
pub mod value;

pub use builtin::{BuiltinContext, BuiltinFn, BuiltinTable, MAX_BUILTINS};
pub use config::{BuiltinBinding, InstanceOptions, LoadOptions, VmConfig};
pub use context::{CallFrame, CallState, ExecContext, FunctionProfile, Interrupt};
pub use domain::{Domain, DomainMask};
pub use error::{AccessError, ExecutionError, TraceFrame, VmError, VmResult};
pub use instance::VmInstance;
pub use loader::load_program;
pub use memory::{EntityMemory, Globals};
pub use runtime::VmRegistry;
pub use string::{StringHandle, StringTable};
pub use value::{EntityHandle, EntityIndex, Pointer, Value};

pub use progs_vm_bytecode;
