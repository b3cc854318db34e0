use crate::descriptor::FunctionDescriptor;
use hal::VAddr;
use spinning_top::Spinlock;

/// Registry capacity recommended by the spec for a kernel hosting a large JIT population. Tests
/// instantiate `FunctionTableRegistry` with a much smaller `N` so a single isolated instance fits
/// comfortably on the test stack.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Implausibly large RVA used to reject a table during `lookup` before even touching its
/// descriptor array - guards against a corrupted `image_base` causing a huge, meaningless `rva`.
const MAX_PLAUSIBLE_RVA: u64 = 0x1_0000_0000; // 4 GiB

#[derive(Clone, Copy)]
struct TableEntry {
    image_base: VAddr,
    descriptors: *const FunctionDescriptor,
    count: usize,
    in_use: bool,
}

impl TableEntry {
    const EMPTY: TableEntry =
        TableEntry { image_base: VAddr::new(0), descriptors: core::ptr::null(), count: 0, in_use: false };

    /// # Safety
    /// Valid only while `in_use`, and only for as long as the caller that registered it upholds
    /// the contract described on `FunctionTableRegistry::register`.
    unsafe fn as_slice(&self) -> &[FunctionDescriptor] {
        unsafe { core::slice::from_raw_parts(self.descriptors, self.count) }
    }
}

// Safety: `descriptors` is never written to or read without the registry's lock held, and the
// pointee is caller-owned memory that outlives every registered image for the registry's lifetime.
unsafe impl Send for TableEntry {}

/// Owns every currently-registered per-image function table. The fixed-capacity array and spin
/// lock here are the "single process-wide component with an explicit initialize step" the design
/// notes ask for in place of scattered global mutable state: callers construct their own instance
/// (there is exactly one live at runtime, held by the kernel in a `poplar_util::InitGuard`), and
/// tests can construct throwaway instances with a small `N`.
pub struct FunctionTableRegistry<const N: usize = DEFAULT_CAPACITY> {
    tables: Spinlock<[TableEntry; N]>,
}

impl<const N: usize> FunctionTableRegistry<N> {
    pub const fn new() -> FunctionTableRegistry<N> {
        FunctionTableRegistry { tables: Spinlock::new([TableEntry::EMPTY; N]) }
    }

    /// Register a sorted, non-overlapping table of `count` descriptors belonging to the image based
    /// at `image_base`. Returns `false` if the registry has no free slot.
    ///
    /// # Safety
    /// `descriptors` must point to `count` valid, sorted-by-`begin_rva` `FunctionDescriptor`s that
    /// remain valid until a matching `deregister` call - the registry never copies or frees them.
    pub unsafe fn register(&self, descriptors: *const FunctionDescriptor, count: usize, image_base: VAddr) -> bool {
        let mut tables = self.tables.lock();
        match tables.iter_mut().find(|entry| !entry.in_use) {
            Some(slot) => {
                *slot = TableEntry { image_base, descriptors, count, in_use: true };
                true
            }
            None => false,
        }
    }

    /// Unlink a previously-registered table by pointer identity. Returns `false` if no matching
    /// in-use entry was found.
    pub fn deregister(&self, descriptors: *const FunctionDescriptor) -> bool {
        let mut tables = self.tables.lock();
        match tables.iter_mut().find(|entry| entry.in_use && entry.descriptors == descriptors) {
            Some(slot) => {
                *slot = TableEntry::EMPTY;
                true
            }
            None => false,
        }
    }

    /// Find the descriptor covering `code_address`, and the image base it was registered against.
    pub fn lookup(&self, code_address: VAddr) -> Option<(FunctionDescriptor, VAddr)> {
        let tables = self.tables.lock();
        for entry in tables.iter().filter(|entry| entry.in_use) {
            let Some(rva) = code_address.offset_from(entry.image_base) else { continue };
            if rva >= MAX_PLAUSIBLE_RVA {
                continue;
            }
            let rva = rva as u32;
            // Safety: the entry is in-use, so its descriptor array is still live per the contract
            // established at `register` and upheld until the matching `deregister`.
            let descriptors = unsafe { entry.as_slice() };
            if let Ok(index) = descriptors.binary_search_by(|d| {
                if rva < d.begin_rva {
                    core::cmp::Ordering::Greater
                } else if rva >= d.end_rva {
                    core::cmp::Ordering::Less
                } else {
                    core::cmp::Ordering::Equal
                }
            }) {
                return Some((descriptors[index], entry.image_base));
            }
        }
        None
    }

    /// The descriptor with `begin_rva == 0` for the image based at `image_base`. Used when pass-1
    /// resumes its search in the parent of a funclet: the parent function's own descriptor is
    /// reached through its image base, not through a code address.
    pub fn find_main_function(&self, image_base: VAddr) -> Option<FunctionDescriptor> {
        let tables = self.tables.lock();
        let entry = tables.iter().find(|entry| entry.in_use && entry.image_base == image_base)?;
        // Safety: see `lookup`.
        let descriptors = unsafe { entry.as_slice() };
        descriptors.binary_search_by(|d| {
            if 0 < d.begin_rva {
                core::cmp::Ordering::Greater
            } else if 0 >= d.end_rva {
                core::cmp::Ordering::Less
            } else {
                core::cmp::Ordering::Equal
            }
        }).ok().map(|index| descriptors[index])
    }
}

impl<const N: usize> Default for FunctionTableRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Object-safe view of the two read operations the stack walker needs, so callers outside this
/// crate don't have to thread the registry's capacity const-generic through every function
/// signature - a single `&dyn FunctionTableLookup` is enough.
pub trait FunctionTableLookup {
    fn lookup(&self, code_address: VAddr) -> Option<(FunctionDescriptor, VAddr)>;
    fn find_main_function(&self, image_base: VAddr) -> Option<FunctionDescriptor>;
}

impl<const N: usize> FunctionTableLookup for FunctionTableRegistry<N> {
    fn lookup(&self, code_address: VAddr) -> Option<(FunctionDescriptor, VAddr)> {
        FunctionTableRegistry::lookup(self, code_address)
    }

    fn find_main_function(&self, image_base: VAddr) -> Option<FunctionDescriptor> {
        FunctionTableRegistry::find_main_function(self, image_base)
    }
}

#[cfg(test)]
mod tests {
    use super::FunctionTableRegistry;
    use crate::descriptor::FunctionDescriptor;
    use hal::VAddr;

    static DESCRIPTORS: [FunctionDescriptor; 3] =
        [FunctionDescriptor::new(0, 0x50, 0x1000), FunctionDescriptor::new(0x50, 0xa0, 0x1010), FunctionDescriptor::new(0xa0, 0x100, 0x1020)];

    #[test]
    fn register_then_lookup() {
        let registry = FunctionTableRegistry::<8>::new();
        let image_base = VAddr::new(0x4000_0000);
        assert!(unsafe { registry.register(DESCRIPTORS.as_ptr(), DESCRIPTORS.len(), image_base) });

        let (descriptor, base) = registry.lookup(image_base + 0x60u64).unwrap();
        assert_eq!(descriptor, DESCRIPTORS[1]);
        assert_eq!(base, image_base);

        assert!(registry.lookup(image_base + 0x200u64).is_none());
        assert!(registry.lookup(VAddr::new(0x1000)).is_none());
    }

    #[test]
    fn deregister_removes_table() {
        let registry = FunctionTableRegistry::<8>::new();
        let image_base = VAddr::new(0x4000_0000);
        unsafe {
            registry.register(DESCRIPTORS.as_ptr(), DESCRIPTORS.len(), image_base);
        }
        assert!(registry.deregister(DESCRIPTORS.as_ptr()));
        assert!(registry.lookup(image_base).is_none());
        assert!(!registry.deregister(DESCRIPTORS.as_ptr()));
    }

    #[test]
    fn capacity_exhausted_returns_false() {
        let registry = FunctionTableRegistry::<1>::new();
        unsafe {
            assert!(registry.register(DESCRIPTORS.as_ptr(), DESCRIPTORS.len(), VAddr::new(0x1000)));
            assert!(!registry.register(DESCRIPTORS.as_ptr(), DESCRIPTORS.len(), VAddr::new(0x2000)));
        }
    }

    #[test]
    fn find_main_function_returns_zero_rva_descriptor() {
        let registry = FunctionTableRegistry::<8>::new();
        let image_base = VAddr::new(0x4000_0000);
        unsafe {
            registry.register(DESCRIPTORS.as_ptr(), DESCRIPTORS.len(), image_base);
        }
        assert_eq!(registry.find_main_function(image_base), Some(DESCRIPTORS[0]));
        assert_eq!(registry.find_main_function(VAddr::new(0x9999)), None);
    }

    #[test]
    fn freed_slot_is_reused() {
        let registry = FunctionTableRegistry::<1>::new();
        unsafe {
            registry.register(DESCRIPTORS.as_ptr(), DESCRIPTORS.len(), VAddr::new(0x1000));
        }
        registry.deregister(DESCRIPTORS.as_ptr());
        unsafe {
            assert!(registry.register(DESCRIPTORS.as_ptr(), DESCRIPTORS.len(), VAddr::new(0x2000)));
        }
    }
}
