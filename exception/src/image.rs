//! A view over a loaded image's raw bytes, and the frame-walking step built on top of it: resolve
//! a code address to its function, reverse its prolog (possibly tail-recursing through a chain of
//! `CHAINED` unwind-info records), and - for the non-chained record that terminates the chain -
//! surface the language handler and clause-table location the dispatcher needs.
//!
//! `UnwindInterpreter` in the `unwind` crate only reverses a single record's prolog; composing a
//! chain of records, and deciding which one in the chain owns the handler data, needs the
//! function-table registry and raw image bytes that only a caller one level up has access to.

use hal::VAddr;
use unwind::{
    descriptor::FunctionDescriptor,
    function_table::FunctionTableLookup,
    interpreter::{GcShadow, RegisterSnapshot, UnwindInterpreter},
    unwind_info::{parse_trailer, ExtendedFlags, UnwindInfoHeader},
    UnwindError,
};

/// A handle onto one image's bytes, read non-destructively. Implemented by `DirectMemory` for the
/// real, privileged dereference used at dispatch time, and by a plain byte-slice wrapper in tests.
pub trait ImageMemory {
    fn read_u64(&self, address: VAddr) -> Option<u64>;
    fn read_bytes(&self, address: VAddr, buf: &mut [u8]) -> Option<()>;
}

/// Reads directly through raw pointers into image memory. There is exactly one of these; it is a
/// zero-sized marker, not a handle to anything that needs constructing.
pub struct DirectMemory;

impl ImageMemory for DirectMemory {
    fn read_u64(&self, address: VAddr) -> Option<u64> {
        if address.as_u64() == 0 {
            return None;
        }
        // Safety: the caller guarantees `address` lies within a still-mapped, still-registered
        // image's code or data, per the contract `FunctionTableRegistry::register` establishes.
        Some(unsafe { address.ptr::<u64>().read_unaligned() })
    }

    fn read_bytes(&self, address: VAddr, buf: &mut [u8]) -> Option<()> {
        if address.as_u64() == 0 {
            return None;
        }
        // Safety: see `read_u64`.
        unsafe { core::ptr::copy_nonoverlapping(address.ptr::<u8>(), buf.as_mut_ptr(), buf.len()) };
        Some(())
    }
}

/// The opcode array of a single function can hold at most 200 two-byte nodes (`UnwindInterpreter`'s
/// own sanity bound), so this buffer is always large enough regardless of how many chained records
/// are walked.
const MAX_OPCODE_BYTES: usize = 200 * 2;

/// Handler RVA (4) + extended flags (1) + associated-data RVA (4), the widest `UnwindTrailer`.
const MAX_TRAILER_BYTES: usize = 9;

/// Everything pass-1/pass-2 need about the function the fault (or the in-progress unwind) landed
/// in, beyond the raw register state: where its clause table lives, if it has one, and where its
/// language handler and associated data sit.
#[derive(Clone, Copy, Debug)]
pub struct FrameHandlerInfo {
    pub descriptor: FunctionDescriptor,
    pub image_base: VAddr,
    pub extended_flags: ExtendedFlags,
    pub handler_rva: Option<u32>,
    pub associated_data_rva: Option<u32>,
    pub clause_table_addr: Option<VAddr>,
    /// Byte length of the clause table at `clause_table_addr`, straight from the trailer - the
    /// only thing in the wire format that bounds a variable-width table without decoding it first.
    pub clause_table_len: Option<u32>,
}

impl FrameHandlerInfo {
    pub fn function_begin(&self) -> VAddr {
        self.descriptor.begin_address(self.image_base)
    }

    pub fn function_end(&self) -> VAddr {
        self.descriptor.end_address(self.image_base)
    }
}

/// Upper bound on a single function's clause-table size: `MAX_CLAUSES_PER_FUNCTION` clauses at the
/// widest possible encoding (a `Typed` clause: up to three 5-byte varints plus an 8-byte type
/// handle). Lets `read_clause_table_bytes` use a fixed stack buffer instead of `alloc`.
pub const MAX_CLAUSE_TABLE_BYTES: usize = unwind::clause::MAX_CLAUSES_PER_FUNCTION * 32;

/// Read `len` bytes (capped at `MAX_CLAUSE_TABLE_BYTES`) of a function's clause table out of
/// `storage`, the caller's stack-allocated scratch buffer.
pub fn read_clause_table_bytes<'buf>(
    memory: &dyn ImageMemory,
    addr: VAddr,
    len: u32,
    storage: &'buf mut [u8; MAX_CLAUSE_TABLE_BYTES],
) -> Result<&'buf [u8], UnwindError> {
    let len = (len as usize).min(MAX_CLAUSE_TABLE_BYTES);
    memory.read_bytes(addr, &mut storage[..len]).ok_or(UnwindError::MalformedUnwind)?;
    Ok(&storage[..len])
}

/// Reverse the prolog of one already-resolved function - `unwind_frame`'s per-chain-link body,
/// extracted so the dispatcher can also call it directly for a funclet's parent, where the
/// descriptor and unwind-info RVA are already known (from `find_main_function`) rather than found
/// by a fresh `lookup`.
pub fn unwind_known_frame(
    memory: &dyn ImageMemory,
    descriptor: FunctionDescriptor,
    image_base: VAddr,
    mut prolog_cursor: u32,
    snapshot: &mut RegisterSnapshot,
) -> Result<(Option<FrameHandlerInfo>, GcShadow), UnwindError> {
    let mut unwind_info_rva = descriptor.unwind_info_rva;
    let mut shadow = GcShadow::default();

    loop {
        let header_addr = image_base + unwind_info_rva as u64;
        let mut header_bytes = [0u8; 4];
        memory.read_bytes(header_addr, &mut header_bytes).ok_or(UnwindError::MalformedUnwind)?;
        let header = UnwindInfoHeader::parse(header_bytes);

        let opcode_len = header.opcode_count as usize * 2;
        let mut opcode_storage = [0u8; MAX_OPCODE_BYTES];
        let opcode_bytes = opcode_storage.get_mut(..opcode_len).ok_or(UnwindError::MalformedUnwind)?;
        memory.read_bytes(header_addr + 4u64, opcode_bytes).ok_or(UnwindError::MalformedUnwind)?;

        // Only the terminal, non-chained record owns the frame's return-address slot - every
        // earlier link in a chain reverses its own opcodes but leaves rip/rsp for the terminal
        // call to pop, or a 2- or 3-level chain would pop the stack that many times over.
        let terminal = !header.is_chained();
        let step =
            UnwindInterpreter::unwind_one_level(&header, opcode_bytes, prolog_cursor, terminal, snapshot, |addr| memory.read_u64(addr))?;
        shadow.merge(step);

        let after_opcodes = header_addr + 4u64 + opcode_len as u64;

        if !header.is_chained() {
            let mut trailer_storage = [0u8; MAX_TRAILER_BYTES];
            memory.read_bytes(after_opcodes, &mut trailer_storage).ok_or(UnwindError::MalformedUnwind)?;
            let (trailer, consumed) = parse_trailer(&trailer_storage, &header).ok_or(UnwindError::MalformedUnwind)?;

            let clause_table_addr = if trailer.extended_flags.has_eh_clauses() { Some(after_opcodes + consumed as u64) } else { None };

            return Ok((
                Some(FrameHandlerInfo {
                    descriptor,
                    image_base,
                    extended_flags: trailer.extended_flags,
                    handler_rva: trailer.handler_rva,
                    associated_data_rva: trailer.associated_data_rva,
                    clause_table_addr,
                    clause_table_len: trailer.clause_table_len,
                }),
                shadow,
            ));
        }

        let mut chained_bytes = [0u8; 12];
        memory.read_bytes(after_opcodes, &mut chained_bytes).ok_or(UnwindError::MalformedUnwind)?;
        let chained = FunctionDescriptor::parse(chained_bytes);
        unwind_info_rva = chained.unwind_info_rva;
        // Every opcode in a chained-to record's prolog has already executed by the time control
        // reaches a later link in the chain, so every opcode applies regardless of code offset.
        prolog_cursor = u32::MAX;
    }
}

/// Resolve `code_address` against the registry, reverse its frame's prolog (and that of every
/// record it chains to), and return the handler data owned by the chain's terminal, non-chained
/// record. `None` handler info means `code_address` matched no registered table at all - the
/// caller treats the frame as a leaf and the return address has already been popped.
pub fn unwind_frame(
    lookup: &dyn FunctionTableLookup,
    memory: &dyn ImageMemory,
    code_address: VAddr,
    snapshot: &mut RegisterSnapshot,
) -> Result<(Option<FrameHandlerInfo>, GcShadow), UnwindError> {
    let Some((descriptor, image_base)) = lookup.lookup(code_address) else {
        let rsp = VAddr::new(snapshot.rsp as usize);
        let return_address = memory.read_u64(rsp).ok_or(UnwindError::EndOfStack)?;
        snapshot.rip = return_address;
        snapshot.rsp += 8;
        return Ok((None, GcShadow::default()));
    };

    let fault_rva = code_address.offset_from(image_base).ok_or(UnwindError::MalformedUnwind)? as u32;
    let prolog_cursor = fault_rva.saturating_sub(descriptor.begin_rva);
    unwind_known_frame(memory, descriptor, image_base, prolog_cursor, snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use unwind::{
        unwind_info::{ExtendedFlags, FLAG_CHAINED},
        FunctionTableRegistry,
    };

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

    fn header_bytes(flags: u8, prolog_size: u8, opcode_count: u8) -> [u8; 4] {
        UnwindInfoHeader { version: 1, flags, prolog_size, opcode_count, frame_register: 0, frame_offset: 0 }.to_bytes()
    }

    #[test]
    fn leaf_frame_pops_return_address_when_table_lookup_misses() {
        let registry = FunctionTableRegistry::<4>::new();
        let stack_base = 0x2000_0000u64;
        let bytes = 0x7777_7777u64.to_le_bytes();
        let image = ByteImage { base: stack_base, bytes: &bytes };

        let mut snapshot = RegisterSnapshot::zeroed();
        snapshot.rsp = stack_base;
        let (handler, shadow) = unwind_frame(&registry, &image, VAddr::new(0x9999), &mut snapshot).unwrap();
        assert!(handler.is_none());
        assert_eq!(snapshot.rip, 0x7777_7777);
        assert_eq!(shadow.location_of(0), None);
    }

    #[test]
    fn single_non_chained_record_surfaces_clause_table_address() {
        let image_base = VAddr::new(0x1000_0000);
        let descriptors = [FunctionDescriptor::new(0, 0x50, 0)];
        let registry = FunctionTableRegistry::<4>::new();
        unsafe {
            registry.register(descriptors.as_ptr(), descriptors.len(), image_base);
        }

        // unwind info at rva 0: header (no opcodes, no handler) + extended flags (has_eh_clauses)
        // + the 4-byte clause-table length that follows whenever that flag is set.
        let mut bytes = std::vec::Vec::new();
        bytes.extend_from_slice(&header_bytes(0, 0, 0));
        bytes.push(ExtendedFlags::root_with_clauses(true).0);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let trailer_len = bytes.len() - header_bytes(0, 0, 0).len();

        // A single, fake "stack" word lives later in the same backing buffer, standing in for the
        // return address at the top of the (otherwise unmodeled) call stack.
        let stack_offset = 0x100usize;
        let mut image_bytes = bytes.clone();
        image_bytes.resize(stack_offset, 0);
        image_bytes.extend_from_slice(&0x7777_7777u64.to_le_bytes());

        let image = ByteImage { base: image_base.as_u64(), bytes: &image_bytes };

        let mut snapshot = RegisterSnapshot::zeroed();
        snapshot.rsp = image_base.as_u64() + stack_offset as u64;
        snapshot.rip = image_base.as_u64();

        let (handler, _) = unwind_frame(&registry, &image, image_base, &mut snapshot).unwrap();
        let handler = handler.unwrap();
        assert!(handler.clause_table_addr.is_some());
        assert_eq!(handler.clause_table_addr.unwrap(), image_base + trailer_len as u64);
        assert_eq!(snapshot.rip, 0x7777_7777);
    }

    /// Encodes a `CHAINED` unwind-info record (no opcodes) at `rva`, immediately followed by the
    /// 12-byte `FunctionDescriptor` pointing at the next link in the chain.
    fn chained_record_bytes(next_rva: u32) -> std::vec::Vec<u8> {
        let mut bytes = header_bytes(FLAG_CHAINED, 0, 0).to_vec();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0x50u32.to_le_bytes());
        bytes.extend_from_slice(&next_rva.to_le_bytes());
        bytes
    }

    /// Encodes the terminal, non-chained record (no opcodes, a clause table) at the caller's
    /// current write position; returns how many trailer bytes it consumed (the extended-flags
    /// byte plus the 4-byte clause-table length that follows it when `has_eh_clauses` is set).
    fn terminal_record_bytes(out: &mut std::vec::Vec<u8>) -> usize {
        out.extend_from_slice(&header_bytes(0, 0, 0));
        out.push(ExtendedFlags::root_with_clauses(true).0);
        out.extend_from_slice(&0u32.to_le_bytes());
        5
    }

    #[test]
    fn two_level_chain_pops_return_address_exactly_once() {
        let image_base = VAddr::new(0x1000_0000);
        let descriptors = [FunctionDescriptor::new(0, 0x50, 0)];
        let registry = FunctionTableRegistry::<4>::new();
        unsafe {
            registry.register(descriptors.as_ptr(), descriptors.len(), image_base);
        }

        // rva 0: chained link -> rva 0x20: terminal record.
        let mut bytes = chained_record_bytes(0x20);
        bytes.resize(0x20, 0);
        let terminal_header_addr = bytes.len() as u32;
        let trailer_len = terminal_record_bytes(&mut bytes);

        let stack_offset = 0x100usize;
        bytes.resize(stack_offset, 0);
        bytes.extend_from_slice(&0x7777_7777u64.to_le_bytes());

        let image = ByteImage { base: image_base.as_u64(), bytes: &bytes };

        let mut snapshot = RegisterSnapshot::zeroed();
        snapshot.rsp = image_base.as_u64() + stack_offset as u64;
        snapshot.rip = image_base.as_u64();

        let (handler, _) = unwind_frame(&registry, &image, image_base, &mut snapshot).unwrap();
        let handler = handler.unwrap();
        assert_eq!(handler.clause_table_addr.unwrap(), image_base + (terminal_header_addr + 4 + trailer_len as u32) as u64);
        // A single pop: rip becomes the return address, rsp advances by exactly one slot.
        assert_eq!(snapshot.rip, 0x7777_7777);
        assert_eq!(snapshot.rsp, image_base.as_u64() + stack_offset as u64 + 8);
    }

    #[test]
    fn three_level_chain_pops_return_address_exactly_once() {
        let image_base = VAddr::new(0x1000_0000);
        let descriptors = [FunctionDescriptor::new(0, 0x50, 0)];
        let registry = FunctionTableRegistry::<4>::new();
        unsafe {
            registry.register(descriptors.as_ptr(), descriptors.len(), image_base);
        }

        // rva 0: chained -> rva 0x20: chained -> rva 0x40: terminal record.
        let mut bytes = chained_record_bytes(0x20);
        bytes.resize(0x20, 0);
        bytes.extend_from_slice(&chained_record_bytes(0x40));
        bytes.resize(0x40, 0);
        let terminal_header_addr = bytes.len() as u32;
        let trailer_len = terminal_record_bytes(&mut bytes);

        let stack_offset = 0x100usize;
        bytes.resize(stack_offset, 0);
        bytes.extend_from_slice(&0x7777_7777u64.to_le_bytes());

        let image = ByteImage { base: image_base.as_u64(), bytes: &bytes };

        let mut snapshot = RegisterSnapshot::zeroed();
        snapshot.rsp = image_base.as_u64() + stack_offset as u64;
        snapshot.rip = image_base.as_u64();

        let (handler, _) = unwind_frame(&registry, &image, image_base, &mut snapshot).unwrap();
        let handler = handler.unwrap();
        assert_eq!(handler.clause_table_addr.unwrap(), image_base + (terminal_header_addr + 4 + trailer_len as u32) as u64);
        // Three links, one pop: rsp advances by exactly 8, not 16 or 24.
        assert_eq!(snapshot.rip, 0x7777_7777);
        assert_eq!(snapshot.rsp, image_base.as_u64() + stack_offset as u64 + 8);
    }
}
