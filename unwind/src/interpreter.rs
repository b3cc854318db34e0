use crate::{
    error::UnwindError,
    unwind_info::{decode_opcode, UnwindInfoHeader, UnwindOpcode},
};
use hal::VAddr;

/// The x86-64 register encoding used throughout the unwind opcodes and the extended-flags frame
/// register field: 0=RAX, 1=RCX, 2=RDX, 3=RBX, 4=RSP, 5=RBP, 6=RSI, 7=RDI, 8..=15=R8..=R15.
pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;

/// Captured CPU state at a throw, hardware-fault, or rethrow site, and at every subsequent
/// unwound frame. Field order and offsets are the single most compatibility-sensitive surface
/// in this crate: `AsmTrampolines` writes this layout directly from assembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RegisterSnapshot {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rflags: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub cs: u16,
    pub ss: u16,
}

const _: () = {
    assert!(core::mem::offset_of!(RegisterSnapshot, rip) == 0x00);
    assert!(core::mem::offset_of!(RegisterSnapshot, rsp) == 0x08);
    assert!(core::mem::offset_of!(RegisterSnapshot, rbp) == 0x10);
    assert!(core::mem::offset_of!(RegisterSnapshot, rflags) == 0x18);
    assert!(core::mem::offset_of!(RegisterSnapshot, rax) == 0x20);
    assert!(core::mem::offset_of!(RegisterSnapshot, rbx) == 0x28);
    assert!(core::mem::offset_of!(RegisterSnapshot, rcx) == 0x30);
    assert!(core::mem::offset_of!(RegisterSnapshot, rdx) == 0x38);
    assert!(core::mem::offset_of!(RegisterSnapshot, rsi) == 0x40);
    assert!(core::mem::offset_of!(RegisterSnapshot, rdi) == 0x48);
    assert!(core::mem::offset_of!(RegisterSnapshot, r8) == 0x50);
    assert!(core::mem::offset_of!(RegisterSnapshot, r15) == 0x88);
    assert!(core::mem::offset_of!(RegisterSnapshot, cs) == 0x90);
    assert!(core::mem::offset_of!(RegisterSnapshot, ss) == 0x92);
    assert!(core::mem::size_of::<RegisterSnapshot>() == 0x98);
};

impl RegisterSnapshot {
    pub const fn zeroed() -> RegisterSnapshot {
        RegisterSnapshot {
            rip: 0,
            rsp: 0,
            rbp: 0,
            rflags: 0,
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            cs: 0,
            ss: 0,
        }
    }

    pub fn get(&self, reg: u8) -> u64 {
        match reg {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Address of the field backing register `reg` within this snapshot - used by `GcRootEnumerator`
    /// to report a register-resident reference's location without the register having been spilled
    /// to the stack by a `SaveNonvol` opcode.
    pub fn address_of(&self, reg: u8) -> VAddr {
        let field: *const u64 = match reg {
            0 => &self.rax,
            1 => &self.rcx,
            2 => &self.rdx,
            3 => &self.rbx,
            4 => &self.rsp,
            5 => &self.rbp,
            6 => &self.rsi,
            7 => &self.rdi,
            8 => &self.r8,
            9 => &self.r9,
            10 => &self.r10,
            11 => &self.r11,
            12 => &self.r12,
            13 => &self.r13,
            14 => &self.r14,
            _ => &self.r15,
        };
        VAddr::from(field)
    }

    pub fn set(&mut self, reg: u8, value: u64) {
        match reg {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            4 => self.rsp = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            _ => self.r15 = value,
        }
    }
}

/// Where the language handler's RVA and associated data were read from. Produced by
/// `unwind_info::parse_trailer`, not by the interpreter itself - reversing a prolog is pure
/// register arithmetic and has no opinion on handler data, which is why `unwind_one_level` below
/// only ever returns a `GcShadow`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LanguageHandler {
    pub handler_rva: u32,
    pub associated_data_rva: Option<u32>,
}

/// Records where a callee-saved register's value was spilled to the stack while reversing a
/// prolog, which `GcRootEnumerator` needs to follow a register-resident reference through a frame
/// that saved it.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcShadow {
    slots: [Option<(u8, VAddr)>; 16],
    len: usize,
}

impl GcShadow {
    fn record(&mut self, reg: u8, address: VAddr) {
        if self.len < self.slots.len() {
            self.slots[self.len] = Some((reg, address));
            self.len += 1;
        }
    }

    pub fn location_of(&self, reg: u8) -> Option<VAddr> {
        self.slots[..self.len].iter().flatten().find(|(r, _)| *r == reg).map(|(_, addr)| *addr)
    }

    /// Fold another frame's shadow into this one. Used when a chained unwind-info record's prolog
    /// spills registers again further up the chain - the outermost save for a given register is
    /// the one still live, but a register already recorded by an inner link is never overwritten.
    pub fn merge(&mut self, other: GcShadow) {
        for slot in &other.slots[..other.len] {
            if let Some((reg, address)) = *slot {
                if self.location_of(reg).is_none() {
                    self.record(reg, address);
                }
            }
        }
    }
}

/// Reverses the effect of one function's prolog on a `RegisterSnapshot`, turning it from "state at
/// some instruction inside this function" into "state immediately after the call that entered it".
/// Stateless: every call takes the header and opcode bytes it needs, so the same interpreter value
/// (there only needs to be one, a unit struct) is reused by the dispatcher and the GC root walker.
pub struct UnwindInterpreter;

impl UnwindInterpreter {
    /// Reverse one function's prolog. `opcode_bytes` holds exactly `header.opcode_count` nodes'
    /// worth of raw bytes. `read_u64` dereferences a stack address; it is a closure so tests can
    /// back it with a plain byte buffer instead of unsafe raw-pointer reads.
    ///
    /// `terminal` marks the chain's last, non-chained record - the one that actually owns the
    /// frame's single return-address slot. A `CHAINED` record's prolog belongs to the same logical
    /// frame as every other link in its chain, so only the terminal call pops the return address;
    /// earlier links only reverse register arithmetic. Callers walking a single, non-chained record
    /// (the common case) pass `true`.
    pub fn unwind_one_level(
        header: &UnwindInfoHeader,
        opcode_bytes: &[u8],
        prolog_cursor: u32,
        terminal: bool,
        snapshot: &mut RegisterSnapshot,
        read_u64: impl Fn(VAddr) -> Option<u64>,
    ) -> Result<GcShadow, UnwindError> {
        const SANITY_LIMIT: u8 = 200;
        if header.opcode_count > SANITY_LIMIT {
            return Err(UnwindError::MalformedUnwind);
        }

        let frame_base = if header.uses_frame_register() {
            VAddr::new(snapshot.get(header.frame_register) as usize) - (16 * header.frame_offset as usize)
        } else {
            VAddr::new(snapshot.rsp as usize)
        };

        let mut machine_frame_fired = false;
        let mut shadow = GcShadow::default();
        let mut index = 0usize;
        while let Some(decoded) = decode_opcode(opcode_bytes, index) {
            index += decoded.nodes_consumed;
            if decoded.code_offset as u32 > prolog_cursor {
                continue;
            }

            match decoded.opcode {
                UnwindOpcode::PushNonvol { reg } => {
                    let rsp = VAddr::new(snapshot.rsp as usize);
                    let value = read_u64(rsp).ok_or(UnwindError::EndOfStack)?;
                    snapshot.set(reg, value);
                    snapshot.rsp += 8;
                }
                UnwindOpcode::AllocSmall { size } | UnwindOpcode::AllocLarge { size } => {
                    snapshot.rsp += size as u64;
                }
                UnwindOpcode::SetFramePointer => {
                    snapshot.rsp = frame_base.as_u64();
                }
                UnwindOpcode::SaveNonvol { reg, scaled_offset } => {
                    let address = frame_base + (scaled_offset as u64 * 8);
                    shadow.record(reg, address);
                    let value = read_u64(address).ok_or(UnwindError::EndOfStack)?;
                    snapshot.set(reg, value);
                }
                UnwindOpcode::SaveNonvolFar { reg, offset } => {
                    let address = frame_base + offset as u64;
                    shadow.record(reg, address);
                    let value = read_u64(address).ok_or(UnwindError::EndOfStack)?;
                    snapshot.set(reg, value);
                }
                UnwindOpcode::SaveXmm128 { .. } => {
                    // Vector registers are out of scope for the snapshot; only the byte cursor
                    // (already advanced above) matters here.
                }
                UnwindOpcode::PushMachineFrame { has_error_code } => {
                    let base = VAddr::new(snapshot.rsp as usize) + if has_error_code { 8u64 } else { 0 };
                    let rip = read_u64(base).ok_or(UnwindError::EndOfStack)?;
                    let rsp = read_u64(base + 24u64).ok_or(UnwindError::EndOfStack)?;
                    let rflags = read_u64(base + 16u64).ok_or(UnwindError::EndOfStack)?;
                    snapshot.rip = rip;
                    snapshot.rsp = rsp;
                    snapshot.rflags = rflags;
                    machine_frame_fired = true;
                }
                UnwindOpcode::Unknown => {}
            }
        }

        if terminal && !machine_frame_fired {
            if snapshot.rsp == 0 {
                return Err(UnwindError::EndOfStack);
            }
            let return_address_slot = VAddr::new(snapshot.rsp as usize);
            let return_address = read_u64(return_address_slot).ok_or(UnwindError::EndOfStack)?;
            snapshot.rip = return_address;
            snapshot.rsp += 8;
        }

        Ok(shadow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind_info::{FLAG_CHAINED, FLAG_HAS_EH_HANDLER};

    fn node_bytes(nodes: &[u16]) -> std::vec::Vec<u8> {
        nodes.iter().flat_map(|n| n.to_le_bytes()).collect()
    }

    #[test]
    fn register_snapshot_is_byte_exact() {
        assert_eq!(core::mem::size_of::<RegisterSnapshot>(), 0x98);
    }

    #[test]
    fn fault_at_first_byte_only_pops_return_address() {
        // No opcodes executed yet (prolog_cursor = 0); a push-rbp opcode at code_offset=1 must be
        // skipped, leaving only the implicit "pop return address" step.
        let header = UnwindInfoHeader { version: 1, flags: 0, prolog_size: 4, opcode_count: 1, frame_register: 0, frame_offset: 0 };
        let opcodes = node_bytes(&[0x5001]); // code_offset=1, opcode=0 (push), reg=5 (rbp)

        let mut snapshot = RegisterSnapshot::zeroed();
        let stack = [0xdead_beefu64];
        snapshot.rsp = stack.as_ptr() as u64;
        let base = stack.as_ptr() as u64;

        let read = |addr: VAddr| -> Option<u64> {
            if addr.as_u64() == base {
                Some(stack[0])
            } else {
                None
            }
        };

        UnwindInterpreter::unwind_one_level(&header, &opcodes, 0, true, &mut snapshot, read).unwrap();
        assert_eq!(snapshot.rip, 0xdead_beef);
        assert_eq!(snapshot.rsp, base + 8);
    }

    #[test]
    fn push_nonvol_applies_when_prolog_has_run() {
        let header = UnwindInfoHeader { version: 1, flags: 0, prolog_size: 4, opcode_count: 1, frame_register: 0, frame_offset: 0 };
        let opcodes = node_bytes(&[0x5001]); // code_offset=1, push rbp

        let mut snapshot = RegisterSnapshot::zeroed();
        let stack = [0x1111_1111u64, 0x2222_2222u64];
        let base = stack.as_ptr() as u64;
        snapshot.rsp = base;

        let read = |addr: VAddr| -> Option<u64> {
            let offset = addr.as_u64().checked_sub(base)? / 8;
            stack.get(offset as usize).copied()
        };

        UnwindInterpreter::unwind_one_level(&header, &opcodes, 5, true, &mut snapshot, read).unwrap();
        // rbp popped from stack[0], rsp advances to stack[1], whose value becomes the return address.
        assert_eq!(snapshot.rbp, 0x1111_1111);
        assert_eq!(snapshot.rip, 0x2222_2222);
    }

    #[test]
    fn unknown_opcode_does_not_abort_the_walk() {
        let header = UnwindInfoHeader { version: 1, flags: 0, prolog_size: 4, opcode_count: 1, frame_register: 0, frame_offset: 0 };
        // opcode nibble 0xf is not a recognised opcode.
        let opcodes = node_bytes(&[0x0f00]);

        let mut snapshot = RegisterSnapshot::zeroed();
        let stack = [0xaaaa_aaaau64];
        let base = stack.as_ptr() as u64;
        snapshot.rsp = base;
        let read = move |addr: VAddr| if addr.as_u64() == base { Some(stack[0]) } else { None };

        let result = UnwindInterpreter::unwind_one_level(&header, &opcodes, 0, true, &mut snapshot, read);
        assert!(result.is_ok());
    }

    #[test]
    fn non_terminal_link_does_not_pop_a_return_address() {
        // A chained (non-terminal) record still reverses its opcodes but leaves rip/rsp alone -
        // the pop belongs to whichever call in the chain is passed `terminal = true`.
        let header = UnwindInfoHeader { version: 1, flags: 0, prolog_size: 4, opcode_count: 1, frame_register: 0, frame_offset: 0 };
        let opcodes = node_bytes(&[0x5001]); // code_offset=1, push rbp

        let mut snapshot = RegisterSnapshot::zeroed();
        let stack = [0x1111_1111u64, 0x2222_2222u64];
        let base = stack.as_ptr() as u64;
        snapshot.rsp = base;

        let read = |addr: VAddr| -> Option<u64> {
            let offset = addr.as_u64().checked_sub(base)? / 8;
            stack.get(offset as usize).copied()
        };

        UnwindInterpreter::unwind_one_level(&header, &opcodes, 5, false, &mut snapshot, read).unwrap();
        // rbp is still popped by the push-rbp opcode itself, but no extra return-address pop runs.
        assert_eq!(snapshot.rbp, 0x1111_1111);
        assert_eq!(snapshot.rsp, base + 8);
        assert_eq!(snapshot.rip, 0);
    }

    #[test]
    fn has_language_handler_flag_is_observed() {
        let header = UnwindInfoHeader { version: 1, flags: FLAG_HAS_EH_HANDLER | FLAG_CHAINED, prolog_size: 0, opcode_count: 0, frame_register: 0, frame_offset: 0 };
        assert!(header.has_language_handler());
        assert!(header.is_chained());
    }

    #[test]
    fn save_nonvol_records_a_gc_shadow_entry() {
        let header = UnwindInfoHeader { version: 1, flags: 0, prolog_size: 8, opcode_count: 1, frame_register: 0, frame_offset: 0 };
        // opcode=4 (SaveNonvol), reg=3 (rbx), code_offset=8, scaled_offset=2 -> frame_base + 16
        let opcodes = node_bytes(&[0x3408, 0x0002]);

        let mut snapshot = RegisterSnapshot::zeroed();
        let stack = [0u64; 8];
        let base = stack.as_ptr() as u64;
        snapshot.rsp = base;
        let read = move |addr: VAddr| {
            let offset = addr.as_u64().checked_sub(base)? / 8;
            stack.get(offset as usize).copied()
        };

        let shadow = UnwindInterpreter::unwind_one_level(&header, &opcodes, 8, true, &mut snapshot, read).unwrap();
        assert_eq!(shadow.location_of(3), Some(VAddr::new(base as usize) + 16usize));
        assert_eq!(shadow.location_of(4), None);
    }
}
