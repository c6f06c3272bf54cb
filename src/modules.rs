//! Loaded-module enumeration
//!
//! The function patcher's foreign-jump heuristic needs to know which address
//! ranges belong to code the process legitimately loaded. A [`ModuleMap`] is
//! a snapshot of those ranges; anything outside of it is assumed to be
//! injected by a third party.

use std::io;

use crate::range::AddressRange;

/// One loaded module (executable or shared library).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Base address of the module's lowest mapping
    pub base: usize,
    /// Total size in bytes covered by the module's mappings
    pub size: usize,
    /// Filesystem path the module was loaded from, when known
    pub path: Option<String>,
}

impl ModuleInfo {
    /// The address range covered by the module.
    pub fn range(&self) -> AddressRange {
        AddressRange::with_len(self.base, self.size)
    }
}

/// A snapshot of the modules loaded in the process.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    /// Modules in the snapshot, unordered
    modules: Vec<ModuleInfo>,
}

impl ModuleMap {
    /// Builds a map from an explicit module list. Useful for tests and for
    /// callers that already track their own module set.
    pub fn from_modules(modules: Vec<ModuleInfo>) -> Self {
        Self { modules }
    }

    /// An empty map: every jump target is considered foreign.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshots the modules currently loaded in this process.
    ///
    /// Only file-backed mappings count as modules; anonymous executable
    /// mappings (JIT pages, our own code buffers) deliberately do not.
    pub fn current() -> io::Result<Self> {
        imp::current()
    }

    /// The modules in the snapshot.
    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    /// Returns whether `address` lies inside any known module.
    pub fn contains(&self, address: usize) -> bool {
        self.module_at(address).is_some()
    }

    /// Returns the module containing `address`, if any.
    pub fn module_at(&self, address: usize) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.range().contains(address))
    }
}

#[cfg(unix)]
mod imp {
    use std::fs;
    use std::io;

    use super::{ModuleInfo, ModuleMap};

    /// Parses `/proc/self/maps`, merging consecutive mappings of the same
    /// file into one module.
    pub fn current() -> io::Result<ModuleMap> {
        let maps = fs::read_to_string("/proc/self/maps")?;
        Ok(parse_maps(&maps))
    }

    /// Builds a module map from the text of a maps file.
    fn parse_maps(maps: &str) -> ModuleMap {
        let mut modules: Vec<ModuleInfo> = Vec::new();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let Some(range) = fields.next() else { continue };
            // skip perms, offset, dev, inode
            let path = match fields.nth(4) {
                Some(p) if p.starts_with('/') => p,
                _ => continue,
            };
            let Some((start, end)) = parse_range(range) else {
                continue;
            };
            match modules.last_mut() {
                // consecutive mapping of the same file: extend the module
                Some(last)
                    if last.path.as_deref() == Some(path) && last.base + last.size <= start =>
                {
                    last.size = end - last.base;
                }
                _ => modules.push(ModuleInfo {
                    base: start,
                    size: end - start,
                    path: Some(path.to_string()),
                }),
            }
        }
        ModuleMap { modules }
    }

    /// Parses the `start-end` hex field of a maps line.
    fn parse_range(field: &str) -> Option<(usize, usize)> {
        let (start, end) = field.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        (start < end).then_some((start, end))
    }

}

#[cfg(windows)]
mod imp {
    use std::ffi::OsString;
    use std::io;
    use std::os::windows::ffi::OsStringExt;

    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::tlhelp32::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W,
        TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
    };

    use super::{ModuleInfo, ModuleMap};

    /// Snapshots the module list via Toolhelp32.
    pub fn current() -> io::Result<ModuleMap> {
        let mut modules = Vec::new();
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, 0);
            if snapshot == INVALID_HANDLE_VALUE {
                return Err(io::Error::last_os_error());
            }
            let mut entry: MODULEENTRY32W = std::mem::zeroed();
            entry.dwSize = std::mem::size_of::<MODULEENTRY32W>() as u32;
            let mut ok = Module32FirstW(snapshot, &mut entry);
            while ok != 0 {
                let len = entry
                    .szExePath
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(entry.szExePath.len());
                let path = OsString::from_wide(&entry.szExePath[..len])
                    .to_string_lossy()
                    .into_owned();
                modules.push(ModuleInfo {
                    base: entry.modBaseAddr as usize,
                    size: entry.modBaseSize as usize,
                    path: Some(path),
                });
                ok = Module32NextW(snapshot, &mut entry);
            }
            CloseHandle(snapshot);
        }
        Ok(ModuleMap { modules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_modules() {
        let map = ModuleMap::from_modules(vec![ModuleInfo {
            base: 0x1000,
            size: 0x1000,
            path: None,
        }]);
        assert!(map.contains(0x1000));
        assert!(map.contains(0x1fff));
        assert!(!map.contains(0x2000));
        assert!(!ModuleMap::empty().contains(0x1000));
    }
}
