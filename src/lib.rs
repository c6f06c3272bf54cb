#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod hook;
pub mod mem;
pub mod modules;
pub mod patch;
pub mod patcher;
pub mod range;
pub mod relocate;
pub mod vtable;
pub mod wrapper;

pub use alloc::{AllocError, BufferPool, CodeBuffer};
pub use hook::{ActiveHook, AsmHookBehavior, Hook, HookEngine, HookError, HookOptions};
pub use patch::Patch;
pub use patcher::{FunctionPatcher, PatcherOptions};
pub use range::AddressRange;
pub use relocate::RelocateError;
pub use vtable::{VTableHook, VirtualTable};
pub use wrapper::{CallingConvention, StackCleanup};
