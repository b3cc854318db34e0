//! Rides the same prolog interpreter the dispatcher uses to walk a thread's stack for the garbage
//! collector: at each frame, find the safe-point active at the current code offset and report the
//! address of every live reference slot to a caller-supplied callback.
//!
//! The wire layout of a function's GC-slot table is left to the code generator and is not part of
//! this crate's bit-exact surface the way the clause table is - a `GcTableSource` supplies the
//! already-decoded `GcSlotTable` for a frame, the same way an external PE-loading collaborator
//! supplies parsed headers to `PeExceptionDirectoryLoader`.

use crate::image::{self, ImageMemory};
use bit_field::BitField;
use hal::VAddr;
use unwind::{
    function_table::FunctionTableLookup,
    interpreter::{GcShadow, RegisterSnapshot},
    UnwindError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotBase {
    FramePointer,
    StackPointer,
    CallerStackPointer,
}

/// One GC root slot: either a register that, at this safe-point, holds a live reference, or a
/// stack location expressed relative to one of the three bases a function's prolog can establish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcSlot {
    Register(u8),
    Stack { base: SlotBase, offset: i32 },
}

/// One instruction offset at which the live-slot set is known, and the bitmap of which of the
/// function's slots (by index into `GcSlotTable::slots`) are live there. Supports at most 64 slots
/// per function, which comfortably covers any single safe-point's live set in practice.
#[derive(Clone, Copy, Debug)]
pub struct SafePoint {
    pub code_offset: u32,
    pub live_bitmap: u64,
}

/// A function's GC metadata: every slot it ever reports, and the safe-points at which some subset
/// of them is live. `safe_points` must be sorted ascending by `code_offset`.
pub struct GcSlotTable<'a> {
    pub slots: &'a [GcSlot],
    pub safe_points: &'a [SafePoint],
}

impl<'a> GcSlotTable<'a> {
    /// The safe-point with the largest `code_offset` that is still `<= code_offset`, per the
    /// lookup rule: a reference is live from the safe-point that recorded it until the next one
    /// changes the picture.
    pub fn safe_point_at_or_before(&self, code_offset: u32) -> Option<&SafePoint> {
        match self.safe_points.binary_search_by_key(&code_offset, |point| point.code_offset) {
            Ok(index) => Some(&self.safe_points[index]),
            Err(0) => None,
            Err(index) => Some(&self.safe_points[index - 1]),
        }
    }
}

/// Supplies the already-decoded `GcSlotTable` for one function, the way an external PE-loading
/// collaborator supplies parsed headers to `PeExceptionDirectoryLoader`: the wire encoding of a
/// function's slot table is the code generator's concern, not this crate's.
pub trait GcTableSource {
    /// The slot table for the function beginning at `function_begin`, if the code generator emitted
    /// one. `None` means that function never holds a reference live across a safe-point.
    fn slot_table_for(&self, function_begin: VAddr) -> Option<GcSlotTable<'_>>;
}

/// Safety net against a corrupt or cyclic unwind chain, matching the dispatcher's own bound.
const MAX_FRAMES: usize = 100;

pub struct GcRootEnumerator;

impl GcRootEnumerator {
    /// Walk every frame from `snapshot` (typically a safe-point snapshot taken at a GC-triggering
    /// allocation or a suspended fiber's resume point) to the end of the stack, reporting the
    /// address of every live reference slot in every frame that has GC metadata. Frames with no
    /// registered slot table (runtime trampolines, leaf functions with no live references) are
    /// walked over silently - `None` from `GcTableSource` is not an error.
    pub fn walk_stack(
        lookup: &dyn FunctionTableLookup,
        memory: &dyn ImageMemory,
        tables: &dyn GcTableSource,
        mut snapshot: RegisterSnapshot,
        mut report: impl FnMut(VAddr),
    ) -> Result<(), UnwindError> {
        for _ in 0..MAX_FRAMES {
            if snapshot.rip == 0 {
                return Ok(());
            }

            let code_address = VAddr::new(snapshot.rip as usize);
            let frame_pointer = VAddr::new(snapshot.rbp as usize);
            let stack_pointer = VAddr::new(snapshot.rsp as usize);
            let frame_snapshot = snapshot;

            let (info, shadow) = image::unwind_frame(lookup, memory, code_address, &mut snapshot)?;
            let caller_stack_pointer = VAddr::new(snapshot.rsp as usize);

            let Some(info) = info else { continue };

            if let Some(table) = tables.slot_table_for(info.function_begin()) {
                let code_offset = code_address.offset_from(info.function_begin()).unwrap_or(0) as u32;
                Self::enumerate_frame(
                    &table,
                    code_offset,
                    &frame_snapshot,
                    &shadow,
                    frame_pointer,
                    stack_pointer,
                    caller_stack_pointer,
                    &mut report,
                );
            }
        }

        Err(UnwindError::MalformedUnwind)
    }

    /// Report the address of every slot live at `code_offset` in one frame. `shadow` is the
    /// `GcShadow` produced while unwinding out of this same frame, so a register slot that was
    /// spilled by a `SaveNonvol` opcode is reported at its spilled stack address rather than the
    /// (now caller-owned) register field in `snapshot`.
    pub fn enumerate_frame(
        table: &GcSlotTable,
        code_offset: u32,
        snapshot: &RegisterSnapshot,
        shadow: &GcShadow,
        frame_pointer: VAddr,
        stack_pointer: VAddr,
        caller_stack_pointer: VAddr,
        mut report: impl FnMut(VAddr),
    ) {
        let Some(safe_point) = table.safe_point_at_or_before(code_offset) else { return };

        for (index, slot) in table.slots.iter().enumerate() {
            if index >= 64 || !safe_point.live_bitmap.get_bit(index) {
                continue;
            }

            let address = match *slot {
                GcSlot::Register(reg) => shadow.location_of(reg).unwrap_or_else(|| snapshot.address_of(reg)),
                GcSlot::Stack { base, offset } => {
                    let base_address = match base {
                        SlotBase::FramePointer => frame_pointer,
                        SlotBase::StackPointer => stack_pointer,
                        SlotBase::CallerStackPointer => caller_stack_pointer,
                    };
                    if offset >= 0 {
                        base_address + offset as u64
                    } else {
                        base_address - (-offset) as usize
                    }
                }
            };
            report(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_point_lookup_picks_the_nearest_preceding_entry() {
        let table = GcSlotTable {
            slots: &[],
            safe_points: &[SafePoint { code_offset: 0x10, live_bitmap: 0 }, SafePoint { code_offset: 0x30, live_bitmap: 0 }],
        };
        assert_eq!(table.safe_point_at_or_before(0x05), None);
        assert_eq!(table.safe_point_at_or_before(0x10).unwrap().code_offset, 0x10);
        assert_eq!(table.safe_point_at_or_before(0x20).unwrap().code_offset, 0x10);
        assert_eq!(table.safe_point_at_or_before(0x30).unwrap().code_offset, 0x30);
    }

    #[test]
    fn register_slot_without_shadow_entry_points_into_snapshot() {
        let table = GcSlotTable { slots: &[GcSlot::Register(3)], safe_points: &[SafePoint { code_offset: 0, live_bitmap: 0b1 }] };
        let snapshot = RegisterSnapshot::zeroed();
        let shadow = GcShadow::default();
        let mut reported = std::vec::Vec::new();
        GcRootEnumerator::enumerate_frame(&table, 0, &snapshot, &shadow, VAddr::new(0), VAddr::new(0), VAddr::new(0), |addr| {
            reported.push(addr)
        });
        assert_eq!(reported, std::vec![snapshot.address_of(3)]);
    }

    #[test]
    fn stack_slot_is_relative_to_requested_base() {
        let table =
            GcSlotTable { slots: &[GcSlot::Stack { base: SlotBase::FramePointer, offset: -8 }], safe_points: &[SafePoint { code_offset: 0, live_bitmap: 0b1 }] };
        let snapshot = RegisterSnapshot::zeroed();
        let shadow = GcShadow::default();
        let mut reported = std::vec::Vec::new();
        let frame_pointer = VAddr::new(0x2000);
        GcRootEnumerator::enumerate_frame(&table, 0, &snapshot, &shadow, frame_pointer, VAddr::new(0), VAddr::new(0), |addr| {
            reported.push(addr)
        });
        assert_eq!(reported, std::vec![frame_pointer - 8usize]);
    }

    #[test]
    fn slot_not_live_at_safe_point_is_skipped() {
        let table = GcSlotTable { slots: &[GcSlot::Register(0)], safe_points: &[SafePoint { code_offset: 0, live_bitmap: 0 }] };
        let snapshot = RegisterSnapshot::zeroed();
        let shadow = GcShadow::default();
        let mut count = 0;
        GcRootEnumerator::enumerate_frame(&table, 0, &snapshot, &shadow, VAddr::new(0), VAddr::new(0), VAddr::new(0), |_| count += 1);
        assert_eq!(count, 0);
    }

    struct ByteImage<'a> {
        base: u64,
        bytes: &'a [u8],
    }

    impl ImageMemory for ByteImage<'_> {
        fn read_u64(&self, address: VAddr) -> Option<u64> {
            let offset = address.as_u64().checked_sub(self.base)? as usize;
            let word: [u8; 8] = self.bytes.get(offset..offset + 8)?.try_into().ok()?;
            Some(u64::from_le_bytes(word))
        }

        fn read_bytes(&self, address: VAddr, buf: &mut [u8]) -> Option<()> {
            let offset = address.as_u64().checked_sub(self.base)? as usize;
            buf.copy_from_slice(self.bytes.get(offset..offset + buf.len())?);
            Some(())
        }
    }

    struct OneFunctionTable<'a> {
        function_begin: VAddr,
        table: GcSlotTable<'a>,
    }

    impl GcTableSource for OneFunctionTable<'_> {
        fn slot_table_for(&self, function_begin: VAddr) -> Option<GcSlotTable<'_>> {
            (function_begin == self.function_begin)
                .then(|| GcSlotTable { slots: self.table.slots, safe_points: self.table.safe_points })
        }
    }

    #[test]
    fn walk_stack_reports_roots_in_a_registered_frame_then_stops_at_the_end_of_the_stack() {
        use unwind::{
            descriptor::FunctionDescriptor,
            unwind_info::{ExtendedFlags, UnwindInfoHeader},
            FunctionTableRegistry,
        };

        let image_base = VAddr::new(0x1000_0000);
        let descriptors = [FunctionDescriptor::new(0, 0x50, 0)];
        let registry = FunctionTableRegistry::<4>::new();
        unsafe {
            registry.register(descriptors.as_ptr(), descriptors.len(), image_base);
        }

        let header = UnwindInfoHeader { version: 1, flags: 0, prolog_size: 0, opcode_count: 0, frame_register: 0, frame_offset: 0 };
        let mut bytes = std::vec::Vec::new();
        bytes.extend_from_slice(&header.to_bytes());
        bytes.push(ExtendedFlags::root_with_clauses(false).0);

        // A single return-address slot stands in for the rest of an (otherwise unmodeled) call
        // stack; the walk pops it, finds no function covering it, pops again, and sees rsp hit 0.
        let return_address_offset = 0x100usize;
        let mut image_bytes = bytes.clone();
        image_bytes.resize(return_address_offset, 0);
        image_bytes.extend_from_slice(&0x7777_7777u64.to_le_bytes());
        image_bytes.extend_from_slice(&0u64.to_le_bytes());

        let image = ByteImage { base: image_base.as_u64(), bytes: &image_bytes };

        let mut snapshot = RegisterSnapshot::zeroed();
        snapshot.rip = image_base.as_u64();
        snapshot.rsp = image_base.as_u64() + return_address_offset as u64;
        snapshot.rax = 0xdead_beef;

        let table = GcSlotTable { slots: &[GcSlot::Register(0)], safe_points: &[SafePoint { code_offset: 0, live_bitmap: 0b1 }] };
        let source = OneFunctionTable { function_begin: image_base, table };

        let mut reported = std::vec::Vec::new();
        GcRootEnumerator::walk_stack(&registry, &image, &source, snapshot, |addr| reported.push(addr)).unwrap();

        assert_eq!(reported, std::vec![snapshot.address_of(0)]);
    }
}
