//! VM execution context
//!
//! The context holds per-instance execution state: the call stack, the
//! saved-locals stack, the statement pointer and the instruction budget.

use progs_vm_bytecode::{FunctionDef, FunctionIndex, ofs_parm};
use thiserror::Error;

use crate::error::{AccessError, ExecutionError, VmError, VmResult};
use crate::memory::Globals;

/// A call stack frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    /// Function running in this frame
    pub function: FunctionIndex,
    /// Statement pointer of the caller when the frame was pushed
    pub caller_statement: usize,
    /// Start of the saved locals window on the local stack
    pub locals_base: usize,
    /// First global cell of the locals window
    pub parm_start: u32,
    /// Size of the locals window in cells
    pub locals: u32,
}

/// Why a call was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Execution fault
    Error,
    /// Instruction ceiling exceeded
    Runaway,
    /// A builtin requested termination
    Abort,
}

/// State of the outermost call on an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallState {
    /// Nothing has run yet
    #[default]
    Ready,
    /// A call is in progress
    Running,
    /// The last call returned normally
    Returned,
    /// The last call was aborted
    Interrupted(Interrupt),
}

/// Per-function execution counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionProfile {
    /// Times the function was called
    pub calls: u64,
    /// Statements executed inside the function
    pub statements: u64,
    /// Builtin calls made by the function
    pub builtin_calls: u64,
}

/// Runtime error of a nested call, raised again in every caller up to the
/// outermost call
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingFault {
    Execution(Box<ExecutionError>),
    Runaway {
        function: String,
        statement: usize,
        limit: u64,
    },
    Abort(String),
}

impl PendingFault {
    /// Runtime errors only; host-side errors stay with the builtin
    pub(crate) fn capture(err: &VmError) -> Option<Self> {
        match err {
            VmError::Execution(exec) => Some(Self::Execution(exec.clone())),
            VmError::Runaway {
                function,
                statement,
                limit,
            } => Some(Self::Runaway {
                function: function.clone(),
                statement: *statement,
                limit: *limit,
            }),
            VmError::HostRequestedAbort(msg) => Some(Self::Abort(msg.clone())),
            _ => None,
        }
    }

    pub(crate) fn into_error(self) -> VmError {
        match self {
            Self::Execution(exec) => VmError::Execution(exec),
            Self::Runaway {
                function,
                statement,
                limit,
            } => VmError::Runaway {
                function,
                statement,
                limit,
            },
            Self::Abort(msg) => VmError::HostRequestedAbort(msg),
        }
    }
}

/// Frame push/pop failures
#[derive(Debug, Error)]
pub enum FrameError {
    /// Call depth limit reached
    #[error("stack overflow ({0} frames)")]
    StackOverflow(usize),
    /// Not enough room to save a locals window
    #[error("locals stack overflow ({needed} cells needed, {available} free)")]
    LocalsOverflow {
        /// Cells the window needs
        needed: usize,
        /// Cells left on the local stack
        available: usize,
    },
    /// Pop with no frame
    #[error("stack underflow")]
    Underflow,
    /// Locals window outside the globals
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Snapshot taken when a call starts, used to unwind it
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallMark {
    depth: usize,
    locals: usize,
    statement: usize,
    pub(crate) outermost: bool,
}

/// Execution state of one VM instance
#[derive(Debug, Clone)]
pub struct ExecContext {
    frames: Vec<CallFrame>,
    local_stack: Vec<u32>,
    statement: usize,
    instructions: u64,
    active_calls: usize,
    state: CallState,
    pending: Option<PendingFault>,
    max_depth: usize,
    local_limit: usize,
}

impl ExecContext {
    /// Create a context with the given limits
    pub fn new(max_depth: usize, local_limit: usize) -> Self {
        Self {
            frames: Vec::with_capacity(max_depth.min(64)),
            local_stack: Vec::with_capacity(local_limit.min(4096)),
            statement: 0,
            instructions: 0,
            active_calls: 0,
            state: CallState::Ready,
            pending: None,
            max_depth,
            local_limit,
        }
    }

    /// Current call depth
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Call stack, outermost first
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// Innermost frame
    #[inline]
    pub fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Statement pointer
    #[inline]
    pub fn statement(&self) -> usize {
        self.statement
    }

    #[inline]
    pub(crate) fn set_statement(&mut self, statement: usize) {
        self.statement = statement;
    }

    /// Instructions executed by the current (or last) outermost call
    #[inline]
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Count one instruction against `limit`; false once it is exceeded
    #[inline]
    pub(crate) fn tick(&mut self, limit: u64) -> bool {
        self.instructions += 1;
        self.instructions <= limit
    }

    /// Cells currently saved on the local stack
    pub fn locals_used(&self) -> usize {
        self.local_stack.len()
    }

    /// State of the outermost call
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Whether a call is in progress
    pub fn is_running(&self) -> bool {
        self.active_calls > 0
    }

    /// Enter a program function: save its locals window, copy the
    /// parameter slots into it and record the caller's statement
    pub fn push_frame(
        &mut self,
        function: FunctionIndex,
        def: &FunctionDef,
        globals: &mut Globals,
    ) -> Result<(), FrameError> {
        if self.frames.len() >= self.max_depth {
            return Err(FrameError::StackOverflow(self.frames.len()));
        }

        let start = def.parm_start as usize;
        let len = def.locals as usize;
        let available = self.local_limit.saturating_sub(self.local_stack.len());
        if len > available {
            return Err(FrameError::LocalsOverflow {
                needed: len,
                available,
            });
        }

        let locals_base = self.local_stack.len();
        self.local_stack.extend_from_slice(globals.cells(start, len)?);
        self.frames.push(CallFrame {
            function,
            caller_statement: self.statement,
            locals_base,
            parm_start: def.parm_start,
            locals: def.locals,
        });

        let mut dst = start;
        for (n, &size) in def.parm_size.iter().take(def.num_parms as usize).enumerate() {
            let src = ofs_parm(n) as usize;
            for j in 0..size as usize {
                let bits = globals.cell(src + j)?;
                globals.set_cell(dst, bits)?;
                dst += 1;
            }
        }
        Ok(())
    }

    /// Leave the innermost function: restore its locals window and the
    /// caller's statement pointer
    pub fn pop_frame(&mut self, globals: &mut Globals) -> Result<CallFrame, FrameError> {
        let frame = self.frames.pop().ok_or(FrameError::Underflow)?;
        let window = globals.cells_mut(frame.parm_start as usize, frame.locals as usize)?;
        window.copy_from_slice(&self.local_stack[frame.locals_base..]);
        self.local_stack.truncate(frame.locals_base);
        self.statement = frame.caller_statement;
        Ok(frame)
    }

    pub(crate) fn begin_call(&mut self) -> CallMark {
        let outermost = self.active_calls == 0;
        if outermost {
            self.instructions = 0;
            self.state = CallState::Running;
            self.pending = None;
        }
        self.active_calls += 1;
        CallMark {
            depth: self.frames.len(),
            locals: self.local_stack.len(),
            statement: self.statement,
            outermost,
        }
    }

    /// Pop every frame pushed since `mark`, restoring locals windows
    pub(crate) fn unwind(&mut self, mark: &CallMark, globals: &mut Globals) {
        while self.frames.len() > mark.depth {
            if self.pop_frame(globals).is_err() {
                break;
            }
        }
        self.frames.truncate(mark.depth);
        self.local_stack.truncate(mark.locals);
        self.statement = mark.statement;
    }

    /// Remember a nested call's runtime error; the first one wins
    pub(crate) fn record_fault(&mut self, err: &VmError) {
        if self.pending.is_none() {
            self.pending = PendingFault::capture(err);
        }
    }

    /// Fault recorded by a nested call that has not been raised yet
    pub(crate) fn pending_fault(&self) -> Option<&PendingFault> {
        self.pending.as_ref()
    }

    pub(crate) fn take_fault(&mut self) -> Option<PendingFault> {
        self.pending.take()
    }

    pub(crate) fn end_call(&mut self, mark: &CallMark, result: &VmResult<()>) {
        self.active_calls = self.active_calls.saturating_sub(1);
        if mark.outermost {
            self.pending = None;
            self.state = match result {
                Ok(()) => CallState::Returned,
                Err(VmError::Runaway { .. }) => CallState::Interrupted(Interrupt::Runaway),
                Err(VmError::HostRequestedAbort(_)) => CallState::Interrupted(Interrupt::Abort),
                Err(_) => CallState::Interrupted(Interrupt::Error),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progs_vm_bytecode::RESERVED_GLOBALS;

    fn globals() -> Globals {
        Globals::new(&[0; RESERVED_GLOBALS as usize + 8])
    }

    fn def(parm_start: u32, locals: u32, parm_size: &[u8]) -> FunctionDef {
        let mut sizes = [0u8; 8];
        sizes[..parm_size.len()].copy_from_slice(parm_size);
        FunctionDef {
            first_statement: 1,
            parm_start,
            locals,
            num_parms: parm_size.len() as u32,
            parm_size: sizes,
            ..Default::default()
        }
    }

    #[test]
    fn test_push_copies_parameters_and_pop_restores() {
        let mut g = globals();
        let base = RESERVED_GLOBALS as usize;
        g.set_float(base, 9.0).unwrap();
        g.set_vector(ofs_parm(0) as usize, [1.0, 2.0, 3.0]).unwrap();
        g.set_float(ofs_parm(1) as usize, 4.0).unwrap();

        let mut ctx = ExecContext::new(8, 64);
        ctx.set_statement(17);
        let f = def(base as u32, 5, &[3, 1]);
        ctx.push_frame(FunctionIndex(1), &f, &mut g).unwrap();
        assert_eq!(g.vector(base).unwrap(), [1.0, 2.0, 3.0]);
        assert_eq!(g.float(base + 3).unwrap(), 4.0);
        assert_eq!(ctx.locals_used(), 5);

        ctx.set_statement(40);
        let frame = ctx.pop_frame(&mut g).unwrap();
        assert_eq!(frame.function, FunctionIndex(1));
        assert_eq!(ctx.statement(), 17);
        assert_eq!(g.float(base).unwrap(), 9.0);
        assert_eq!(ctx.locals_used(), 0);
    }

    #[test]
    fn test_depth_limit() {
        let mut g = globals();
        let mut ctx = ExecContext::new(2, 64);
        let f = def(RESERVED_GLOBALS as u32, 1, &[]);
        ctx.push_frame(FunctionIndex(1), &f, &mut g).unwrap();
        ctx.push_frame(FunctionIndex(1), &f, &mut g).unwrap();
        assert!(matches!(
            ctx.push_frame(FunctionIndex(1), &f, &mut g),
            Err(FrameError::StackOverflow(2))
        ));
    }

    #[test]
    fn test_locals_limit() {
        let mut g = globals();
        let mut ctx = ExecContext::new(8, 6);
        let f = def(RESERVED_GLOBALS as u32, 4, &[]);
        ctx.push_frame(FunctionIndex(1), &f, &mut g).unwrap();
        assert!(matches!(
            ctx.push_frame(FunctionIndex(1), &f, &mut g),
            Err(FrameError::LocalsOverflow {
                needed: 4,
                available: 2
            })
        ));
    }

    #[test]
    fn test_unwind_and_state() {
        let mut g = globals();
        let mut ctx = ExecContext::new(8, 64);
        let mark = ctx.begin_call();
        assert!(mark.outermost);
        assert_eq!(ctx.state(), CallState::Running);

        let f = def(RESERVED_GLOBALS as u32, 2, &[]);
        ctx.push_frame(FunctionIndex(1), &f, &mut g).unwrap();
        ctx.push_frame(FunctionIndex(1), &f, &mut g).unwrap();
        ctx.unwind(&mark, &mut g);
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.locals_used(), 0);

        let result = Err(VmError::abort("stop"));
        ctx.end_call(&mark, &result);
        assert_eq!(ctx.state(), CallState::Interrupted(Interrupt::Abort));
        assert!(!ctx.is_running());
    }
}
