//! # Calling convention wrappers
//!
//! Generated stubs that accept a call under one [`CallingConvention`] and
//! forward it to a function expecting another. The engine uses these in both
//! directions: a reverse wrapper makes a Rust detour callable from a foreign
//! convention's call sites, and a forward wrapper makes the foreign
//! trampoline callable from Rust as a plain function.
//!
//! The marshalling strategy is uniform rather than clever: every parameter
//! is spilled to a stack block in index order, the callee's register
//! parameters are loaded back from the block, and the rest of the block is
//! left in place as the callee's stack parameters. This costs a few moves
//! for register-to-register cases but handles any register assignment with
//! one code path.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, IcedError, Instruction, InstructionBlock,
    MemoryOperand, Register,
};
use thiserror::Error;

use crate::alloc::CodeBuffer;

pub mod convention;

pub use convention::{CallingConvention, StackCleanup};

/// Errors raised while generating a wrapper stub
#[derive(Debug, Error)]
pub enum WrapperError {
    /// A convention descriptor cannot be marshalled
    #[error("invalid calling convention: {0}")]
    Convention(&'static str),
    /// The stub failed to assemble
    #[error("failed to assemble wrapper: {0}")]
    Assemble(#[from] IcedError),
}

/// A generated wrapper stub.
#[derive(Debug, Clone, Copy)]
pub struct WrapperStub {
    /// Entry point, callable under the wrapper's caller convention
    pub entry: usize,
    /// Address of the 8-byte pointer cell holding the forward target
    pub slot: usize,
}

/// Upper bound on the buffer space a wrapper for `param_count` parameters
/// can consume, including its pointer cell and alignment padding.
pub fn size_bound(param_count: usize) -> usize {
    // slot + alignment + frame setup/teardown + per-parameter spill and load
    16 + 48 + 16 * param_count
}

/// Emits a stub into `buffer` that is callable under `caller` and forwards
/// its first `param_count` integer parameters to `target`, which expects the
/// `callee` convention.
///
/// The target address lives in a pointer cell next to the stub; rewriting
/// the cell redirects the stub without touching its code.
pub fn emit_wrapper(
    buffer: &mut CodeBuffer,
    target: usize,
    caller: &CallingConvention,
    callee: &CallingConvention,
    param_count: usize,
) -> Result<WrapperStub, WrapperError> {
    validate(caller)?;
    validate(callee)?;
    let scratch = pick_scratch(caller)?;

    let caller_regs = caller.register_params(param_count);
    let callee_regs = callee.register_params(param_count);
    let caller_stack = caller.stack_params(param_count);
    if caller.cleanup == StackCleanup::Callee && 8 * caller_stack > u16::MAX as usize {
        return Err(WrapperError::Convention("callee cleanup exceeds ret imm16"));
    }

    buffer.align(8);
    let slot = buffer.write(&(target as u64).to_le_bytes());
    let entry = buffer.current();

    let mut code = Vec::new();
    code.push(Instruction::with1(Code::Push_r64, Register::RBP)?);
    code.push(Instruction::with2(
        Code::Mov_r64_rm64,
        Register::RBP,
        Register::RSP,
    )?);

    // keep rsp 16-byte aligned at the call; rbp is aligned here, and the
    // spill block, reserved space and padding sit below it
    let below_rbp = 8 * (param_count - callee_regs) + callee.reserved_stack;
    let pad = (16 - below_rbp % 16) % 16;
    if pad > 0 {
        code.push(Instruction::with2(
            Code::Sub_rm64_imm32,
            Register::RSP,
            pad as i32,
        )?);
    }

    // spill every parameter right to left so parameter i lands at [rsp+8*i]
    for i in (0..param_count).rev() {
        if i < caller_regs {
            code.push(Instruction::with1(
                Code::Push_r64,
                caller.param_registers[i],
            )?);
        } else {
            // incoming stack parameter, above the saved frame and return
            // address and the caller-reserved area
            let disp = 16 + caller.reserved_stack + 8 * (i - caller_regs);
            code.push(Instruction::with2(
                Code::Mov_r64_rm64,
                scratch,
                MemoryOperand::with_base_displ(Register::RBP, disp as i64),
            )?);
            code.push(Instruction::with1(Code::Push_r64, scratch)?);
        }
    }

    // load the callee's register parameters back from the block
    for (i, &register) in callee.param_registers[..callee_regs].iter().enumerate() {
        code.push(Instruction::with2(
            Code::Mov_r64_rm64,
            register,
            MemoryOperand::with_base_displ(Register::RSP, (8 * i) as i64),
        )?);
    }
    // drop the register-passed copies; what remains is the callee's stack
    // parameter area
    if callee_regs > 0 {
        code.push(Instruction::with2(
            Code::Add_rm64_imm32,
            Register::RSP,
            (8 * callee_regs) as i32,
        )?);
    }
    if callee.reserved_stack > 0 {
        code.push(Instruction::with2(
            Code::Sub_rm64_imm32,
            Register::RSP,
            callee.reserved_stack as i32,
        )?);
    }

    code.push(Instruction::with1(
        Code::Call_rm64,
        MemoryOperand::with_base_displ(Register::RIP, slot as i64),
    )?);

    if caller.return_register != callee.return_register {
        code.push(Instruction::with2(
            Code::Mov_r64_rm64,
            caller.return_register,
            callee.return_register,
        )?);
    }

    code.push(Instruction::with2(
        Code::Mov_r64_rm64,
        Register::RSP,
        Register::RBP,
    )?);
    code.push(Instruction::with1(Code::Pop_r64, Register::RBP)?);
    if caller.cleanup == StackCleanup::Callee && caller_stack > 0 {
        code.push(Instruction::with1(
            Code::Retnq_imm16,
            (8 * caller_stack) as i32,
        )?);
    } else {
        code.push(Instruction::with(Code::Retnq));
    }

    let block = InstructionBlock::new(&code, entry as u64);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
    buffer.write(&encoded.code_buffer);
    log::trace!(
        "emitted {} parameter wrapper at {entry:#x} forwarding to {target:#x}",
        param_count
    );
    Ok(WrapperStub { entry, slot })
}

/// Emits a host-convention entry that forwards to `function`, which expects
/// the `from` convention. When `from` is already the host convention the
/// function itself is returned and nothing is emitted.
pub fn emit_forward_wrapper(
    buffer: &mut CodeBuffer,
    function: usize,
    from: &CallingConvention,
    param_count: usize,
) -> Result<usize, WrapperError> {
    let host = CallingConvention::host();
    if *from == host {
        return Ok(function);
    }
    Ok(emit_wrapper(buffer, function, &host, from, param_count)?.entry)
}

/// Emits a `from`-convention entry that forwards to `callable`, a function
/// compiled for the host convention. When `from` is already the host
/// convention the callable itself is returned and nothing is emitted.
pub fn emit_reverse_wrapper(
    buffer: &mut CodeBuffer,
    callable: usize,
    from: &CallingConvention,
    param_count: usize,
) -> Result<usize, WrapperError> {
    let host = CallingConvention::host();
    if *from == host {
        return Ok(callable);
    }
    Ok(emit_wrapper(buffer, callable, from, &host, param_count)?.entry)
}

/// Rejects descriptors the emitter cannot marshal.
fn validate(convention: &CallingConvention) -> Result<(), WrapperError> {
    if !convention.return_register.is_gpr64() {
        return Err(WrapperError::Convention("return register must be a 64-bit GPR"));
    }
    if convention.return_register == Register::RSP || convention.return_register == Register::RBP {
        return Err(WrapperError::Convention(
            "rsp and rbp cannot carry the return value",
        ));
    }
    for (i, register) in convention.param_registers.iter().enumerate() {
        if !register.is_gpr64() {
            return Err(WrapperError::Convention("parameter registers must be 64-bit GPRs"));
        }
        if convention.param_registers[..i].contains(register) {
            return Err(WrapperError::Convention("duplicate parameter register"));
        }
        if *register == Register::RSP || *register == Register::RBP {
            return Err(WrapperError::Convention("rsp and rbp cannot carry parameters"));
        }
    }
    Ok(())
}

/// Picks a volatile register the stub may clobber while the caller's
/// parameter registers are still live.
fn pick_scratch(caller: &CallingConvention) -> Result<Register, WrapperError> {
    [Register::RAX, Register::R10, Register::R11]
        .into_iter()
        .find(|r| !caller.param_registers.contains(r))
        .ok_or(WrapperError::Convention("no scratch register available"))
}
