use indexmap::IndexMap;
use smallvec::SmallVec;
use trapvisor_core::Pa;

use crate::BreakpointId;

/// Shared state of one physical trap location.
#[derive(Debug)]
pub(crate) struct RegistryEntry {
    /// The byte the trap opcode replaced.
    pub(crate) original: u8,

    /// Whether guest memory currently holds the trap opcode.
    pub(crate) installed: bool,

    /// Number of vCPUs single-stepping over this location.
    pub(crate) stepping: u16,

    /// Breakpoints sharing this location, in creation order.
    pub(crate) members: SmallVec<[BreakpointId; 2]>,
}

impl RegistryEntry {
    pub(crate) fn new(original: u8) -> Self {
        Self {
            original,
            installed: false,
            stepping: 0,
            members: SmallVec::new(),
        }
    }

    pub(crate) fn detach(&mut self, id: BreakpointId) {
        self.members.retain(|member| *member != id);
    }
}

/// Trap locations keyed by physical address.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: IndexMap<Pa, RegistryEntry>,
}

impl Registry {
    pub(crate) fn contains(&self, pa: Pa) -> bool {
        self.entries.contains_key(&pa)
    }

    pub(crate) fn get(&self, pa: Pa) -> Option<&RegistryEntry> {
        self.entries.get(&pa)
    }

    pub(crate) fn get_mut(&mut self, pa: Pa) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(&pa)
    }

    pub(crate) fn insert(&mut self, pa: Pa, entry: RegistryEntry) {
        self.entries.insert(pa, entry);
    }

    pub(crate) fn remove(&mut self, pa: Pa) -> Option<RegistryEntry> {
        self.entries.shift_remove(&pa)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (Pa, RegistryEntry)> + '_ {
        self.entries.drain(..)
    }

    /// Replaces installed traps inside `buffer`, which mirrors guest memory
    /// starting at `base`, with the bytes they hide.
    pub(crate) fn overlay(&self, base: Pa, buffer: &mut [u8]) {
        for (pa, entry) in &self.entries {
            if !entry.installed || *pa < base {
                continue;
            }

            if let Some(byte) = buffer.get_mut((*pa - base).0 as usize) {
                *byte = entry.original;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_restores_installed_traps_only() {
        let mut registry = Registry::default();

        let mut installed = RegistryEntry::new(0x48);
        installed.installed = true;
        registry.insert(Pa(0x1002), installed);
        registry.insert(Pa(0x1004), RegistryEntry::new(0x90));

        let mut outside = RegistryEntry::new(0x55);
        outside.installed = true;
        registry.insert(Pa(0x2000), outside);

        let mut buffer = [0xcc; 8];
        registry.overlay(Pa(0x1000), &mut buffer);

        assert_eq!(buffer, [0xcc, 0xcc, 0x48, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc]);
    }

    #[test]
    fn detach_keeps_order() {
        let mut entry = RegistryEntry::new(0);
        entry.members.extend([BreakpointId(1), BreakpointId(2), BreakpointId(3)]);
        entry.detach(BreakpointId(2));

        assert_eq!(entry.members.as_slice(), [BreakpointId(1), BreakpointId(3)]);
    }
}
