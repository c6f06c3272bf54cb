//! # Virtual dispatch table hooking
//!
//! Virtual calls dispatch through a table of function pointers, so they can
//! be intercepted without touching any code: rewriting one pointer slot
//! redirects every call through that slot. [`VirtualTable`] models a table
//! found in memory; [`VTableHook`] is the pointer-slot analogue of a code
//! hook, with the same enable/disable surface and no removal.
//!
//! For tables whose methods use a non-host calling convention,
//! [`VirtualTable::create_wrapper`] emits a host-callable wrapper around an
//! entry using the engine's buffer pool.

use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::alloc::{AllocError, CodeBuffer};
use crate::hook::HookEngine;
use crate::mem::{LiveMemory, MemoryError, MemorySource};
use crate::patch::Patch;
use crate::range::AddressRange;
use crate::wrapper::{self, CallingConvention, WrapperError};

/// Size of one table slot.
const SLOT: usize = std::mem::size_of::<usize>();

/// Allocates from the engine's pool, preferring placement near `origin` but
/// accepting anywhere; neither cloned tables nor wrappers need relative
/// reach.
fn allocate(engine: &HookEngine, origin: usize, size: usize) -> Result<CodeBuffer, AllocError> {
    match engine.pool().allocate(origin, size) {
        Err(AllocError::OutOfRange) | Err(AllocError::OutOfMemory) => engine
            .pool()
            .allocate_in_range(size, AddressRange::new(0x10000, 0x7fff_ffff_ffff), 1),
        other => other,
    }
}

/// Errors raised while inspecting or hooking a virtual table
#[derive(Debug, Error)]
pub enum VTableError {
    /// Index past the table's declared entry count
    #[error("entry {index} out of bounds for a table of {count}")]
    OutOfBounds {
        /// Requested entry index
        index: usize,
        /// Declared entry count
        count: usize,
    },
    /// The table (or object) memory is not readable
    #[error("table memory at {address:#x} is not readable")]
    Unreadable {
        /// The faulting address
        address: usize,
    },
    /// A pointer-slot write failed
    #[error("slot write failed: {0}")]
    Memory(#[from] MemoryError),
    /// Buffer allocation for a cloned table or wrapper failed
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// Wrapper generation failed
    #[error("wrapper generation failed: {0}")]
    Wrapper(#[from] WrapperError),
}

/// A virtual dispatch table: `count` consecutive function pointers.
pub struct VirtualTable {
    /// Address of slot 0
    base: usize,
    /// Number of entries
    count: usize,
    /// Backing buffer for cloned tables, never reclaimed while an object
    /// points at it
    _storage: Option<ManuallyDrop<CodeBuffer>>,
}

impl VirtualTable {
    /// Wraps a table already located at `table` with `count` entries.
    pub fn from_address(table: usize, count: usize) -> Self {
        Self {
            base: table,
            count,
            _storage: None,
        }
    }

    /// Reads an object's table pointer (its first pointer-sized field) and
    /// wraps the table it points to.
    pub fn from_instance(object: usize, count: usize) -> Result<Self, VTableError> {
        let table = LiveMemory
            .read_ptr(object)
            .ok_or(VTableError::Unreadable { address: object })?;
        Ok(Self::from_address(table, count))
    }

    /// Address of slot 0.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of entries.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Address of the pointer slot for entry `index`.
    pub fn slot(&self, index: usize) -> Result<usize, VTableError> {
        if index >= self.count {
            return Err(VTableError::OutOfBounds {
                index,
                count: self.count,
            });
        }
        Ok(self.base + index * SLOT)
    }

    /// The function pointer currently stored in entry `index`.
    pub fn entry(&self, index: usize) -> Result<usize, VTableError> {
        let slot = self.slot(index)?;
        LiveMemory
            .read_ptr(slot)
            .ok_or(VTableError::Unreadable { address: slot })
    }

    /// Builds a hook over entry `index` routing calls to `detour`.
    ///
    /// The current entry value is captured as the original; nothing is
    /// written until [`VTableHook::enable`].
    pub fn hook_entry(&self, index: usize, detour: usize) -> Result<VTableHook, VTableError> {
        let slot = self.slot(index)?;
        let original = self.entry(index)?;
        log::debug!("vtable hook on slot {slot:#x}: {original:#x} -> {detour:#x}");
        Ok(VTableHook {
            slot,
            enable: Patch::new(slot, (detour as u64).to_le_bytes().to_vec()),
            disable: Patch::new(slot, (original as u64).to_le_bytes().to_vec()),
            enabled: AtomicBool::new(false),
            original,
        })
    }

    /// Emits a host-convention callable around entry `index`, whose code the
    /// table declares as using the `from` convention with `param_count`
    /// integer parameters. Returns the entry itself when `from` is already
    /// the host convention.
    pub fn create_wrapper(
        &self,
        engine: &HookEngine,
        index: usize,
        from: &CallingConvention,
        param_count: usize,
    ) -> Result<VTableWrapper, VTableError> {
        let entry = self.entry(index)?;
        if *from == CallingConvention::host() {
            return Ok(VTableWrapper {
                entry,
                _storage: None,
            });
        }
        let mut buffer = allocate(engine, entry, wrapper::size_bound(param_count))?;
        let wrapped = wrapper::emit_forward_wrapper(&mut buffer, entry, from, param_count)?;
        Ok(VTableWrapper {
            entry: wrapped,
            _storage: Some(ManuallyDrop::new(buffer)),
        })
    }

    /// Copies the table an object points to into engine-owned memory and
    /// repoints that single object at the copy.
    ///
    /// Hooks on the copy affect only this instance; every other object
    /// sharing the class's table keeps dispatching through the original.
    ///
    /// # Safety
    ///
    /// `object` must point at an object whose first field is a table pointer
    /// with at least `count` valid entries, and no other thread may be
    /// reading the pointer concurrently with the repoint.
    pub unsafe fn clone_for_instance(
        engine: &HookEngine,
        object: usize,
        count: usize,
    ) -> Result<Self, VTableError> {
        let table = LiveMemory
            .read_ptr(object)
            .ok_or(VTableError::Unreadable { address: object })?;
        let bytes = LiveMemory
            .read(table, count * SLOT)
            .ok_or(VTableError::Unreadable { address: table })?;

        let mut buffer = allocate(engine, table, count * SLOT + SLOT)?;
        buffer.align(SLOT);
        let copy = buffer.write(&bytes);
        crate::mem::write_bytes(object, &(copy as u64).to_le_bytes())?;
        log::debug!("cloned {count} entry table {table:#x} -> {copy:#x} for object {object:#x}");
        Ok(Self {
            base: copy,
            count,
            _storage: Some(ManuallyDrop::new(buffer)),
        })
    }
}

/// A generated host-callable wrapper around one table entry.
pub struct VTableWrapper {
    /// Host-convention entry point
    pub entry: usize,
    /// Stub storage, kept alive for the process lifetime
    _storage: Option<ManuallyDrop<CodeBuffer>>,
}

/// A hook over one pointer slot of a virtual table.
///
/// Enable and disable rewrite the slot only; the functions on either side
/// are never modified.
pub struct VTableHook {
    /// Address of the hooked slot
    slot: usize,
    /// Slot write installing the detour
    enable: Patch,
    /// Slot write restoring the original pointer
    disable: Patch,
    /// Current state
    enabled: AtomicBool,
    /// The pointer the slot held before hooking
    original: usize,
}

impl VTableHook {
    /// The hooked slot address.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The function pointer the slot held before hooking.
    pub fn original(&self) -> usize {
        self.original
    }

    /// Whether calls currently route to the detour.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Writes the detour pointer into the slot. Idempotent.
    ///
    /// # Safety
    ///
    /// The detour must match the entry's signature and convention, and the
    /// pointer-sized write is not atomic against concurrent virtual calls
    /// through the slot.
    pub unsafe fn enable(&self) -> Result<(), MemoryError> {
        self.enable.apply()?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Restores the original pointer. Idempotent.
    ///
    /// # Safety
    ///
    /// Same considerations as [`enable`](Self::enable).
    pub unsafe fn disable(&self) -> Result<(), MemoryError> {
        self.disable.apply()?;
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }
}
