//! Calling convention descriptors
//!
//! A [`CallingConvention`] describes how integer and pointer parameters reach
//! a function and how it returns: which registers carry leading parameters,
//! where the rest sit on the stack, who pops them, and how much scratch space
//! the caller reserves. The wrapper emitter consumes two descriptors and
//! bridges between them.
//!
//! Floating point parameters are out of scope; the descriptors cover the
//! integer register file only.

use iced_x86::Register;

/// Who removes stack-passed parameters after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCleanup {
    /// No stack parameters are ever passed, nothing to clean up
    None,
    /// The caller pops its own arguments (C-style)
    Caller,
    /// The callee pops the arguments with `ret imm16` (stdcall-style)
    Callee,
}

/// How a function expects to be called.
///
/// Two descriptors compare equal exactly when a call under one is already a
/// valid call under the other, which is what lets the hook engine skip
/// wrapper generation entirely for same-convention hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingConvention {
    /// Registers carrying the leading parameters, in order
    pub param_registers: Vec<Register>,
    /// Register holding the integer return value
    pub return_register: Register,
    /// Who pops stack-passed parameters
    pub cleanup: StackCleanup,
    /// Bytes of scratch space the caller reserves below the stack parameters
    /// (the Microsoft "shadow space")
    pub reserved_stack: usize,
}

impl CallingConvention {
    /// The System V AMD64 convention used on Unix-likes.
    pub fn system_v() -> Self {
        Self {
            param_registers: vec![
                Register::RDI,
                Register::RSI,
                Register::RDX,
                Register::RCX,
                Register::R8,
                Register::R9,
            ],
            return_register: Register::RAX,
            cleanup: StackCleanup::Caller,
            reserved_stack: 0,
        }
    }

    /// The Microsoft x64 convention used on Windows.
    pub fn microsoft_x64() -> Self {
        Self {
            param_registers: vec![Register::RCX, Register::RDX, Register::R8, Register::R9],
            return_register: Register::RAX,
            cleanup: StackCleanup::Caller,
            reserved_stack: 32,
        }
    }

    /// The convention this build of the crate itself is compiled for.
    pub fn host() -> Self {
        #[cfg(windows)]
        {
            Self::microsoft_x64()
        }
        #[cfg(not(windows))]
        {
            Self::system_v()
        }
    }

    /// Number of parameters passed in registers for an `n`-parameter call.
    pub fn register_params(&self, n: usize) -> usize {
        n.min(self.param_registers.len())
    }

    /// Number of parameters passed on the stack for an `n`-parameter call.
    pub fn stack_params(&self, n: usize) -> usize {
        n.saturating_sub(self.param_registers.len())
    }
}
