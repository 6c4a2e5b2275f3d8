//! Memory map inspection
//!
//! Read-only queries over the boot memory map: totals, validation,
//! and region search. The frame allocator consumes the raw entries;
//! this manager exists for diagnostics and sanity checks before the
//! allocator is seeded.

use crate::boot::{MemoryRegion, RegionKind};
use crate::log_info;

/// Memory map manager
pub struct MemoryMapManager {
    entries: &'static [MemoryRegion],
    total_memory: u64,
    usable_memory: u64,
}

impl MemoryMapManager {
    /// Create a new memory map manager
    pub fn new(entries: &'static [MemoryRegion]) -> Self {
        let mut total = 0;
        let mut usable = 0;

        for entry in entries {
            total += entry.length;
            if entry.is_available() {
                usable += entry.length;
            }
        }

        Self {
            entries,
            total_memory: total,
            usable_memory: usable,
        }
    }

    /// Total physical memory covered by the map
    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Usable (Available) physical memory
    pub fn usable_memory(&self) -> u64 {
        self.usable_memory
    }

    /// Raw entries
    pub fn entries(&self) -> &[MemoryRegion] {
        self.entries
    }

    /// Largest Available region, if any
    pub fn largest_available_region(&self) -> Option<&MemoryRegion> {
        self.entries
            .iter()
            .filter(|entry| entry.is_available())
            .max_by_key(|entry| entry.length)
    }

    /// Kind of memory at the given address (Reserved when unmapped)
    pub fn kind_at(&self, addr: u64) -> RegionKind {
        for entry in self.entries {
            if addr >= entry.base && addr < entry.end() {
                return entry.kind;
            }
        }
        RegionKind::Reserved
    }

    /// Validate map consistency
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.entries.is_empty() {
            return Err("empty memory map");
        }

        for i in 0..self.entries.len() {
            for j in i + 1..self.entries.len() {
                let a = &self.entries[i];
                let b = &self.entries[j];
                if a.base < b.end() && b.base < a.end() {
                    return Err("overlapping memory regions");
                }
            }
        }

        Ok(())
    }

    /// Log the map at Info level
    pub fn log_map(&self) {
        log_info!("boot", "memory map ({} regions):", self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            log_info!(
                "boot",
                "  {}: {:#012x}..{:#012x} {:?}",
                i,
                entry.base,
                entry.end(),
                entry.kind
            );
        }
        log_info!(
            "boot",
            "total {} KiB, usable {} KiB",
            self.total_memory / 1024,
            self.usable_memory / 1024
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_map() -> &'static [MemoryRegion] {
        &[
            MemoryRegion {
                base: 0,
                length: 0x8_0000,
                kind: RegionKind::Reserved,
            },
            MemoryRegion {
                base: 0x10_0000,
                length: 0x3F0_0000,
                kind: RegionKind::Available,
            },
            MemoryRegion {
                base: 0x400_0000,
                length: 0x1000,
                kind: RegionKind::Acpi,
            },
        ]
    }

    #[test]
    fn test_totals() {
        let mgr = MemoryMapManager::new(test_map());
        assert_eq!(mgr.usable_memory(), 0x3F0_0000);
        assert_eq!(mgr.total_memory(), 0x8_0000 + 0x3F0_0000 + 0x1000);
    }

    #[test]
    fn test_largest_region() {
        let mgr = MemoryMapManager::new(test_map());
        let largest = mgr.largest_available_region().unwrap();
        assert_eq!(largest.base, 0x10_0000);
    }

    #[test]
    fn test_kind_lookup() {
        let mgr = MemoryMapManager::new(test_map());
        assert_eq!(mgr.kind_at(0x10_0000), RegionKind::Available);
        assert_eq!(mgr.kind_at(0x400_0000), RegionKind::Acpi);
        // Holes read back as Reserved
        assert_eq!(mgr.kind_at(0x9_0000), RegionKind::Reserved);
    }

    #[test]
    fn test_validate_overlap() {
        let overlapping: &'static [MemoryRegion] = &[
            MemoryRegion {
                base: 0,
                length: 0x2000,
                kind: RegionKind::Available,
            },
            MemoryRegion {
                base: 0x1000,
                length: 0x2000,
                kind: RegionKind::Available,
            },
        ];
        let mgr = MemoryMapManager::new(overlapping);
        assert!(mgr.validate().is_err());

        let good = MemoryMapManager::new(test_map());
        assert!(good.validate().is_ok());
    }
}
