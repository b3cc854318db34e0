use bit_field::BitField;

/// Flag bits living in the low 5 bits of the header's first byte, alongside the 3-bit version.
pub const FLAG_HAS_EH_HANDLER: u8 = 1 << 0;
pub const FLAG_HAS_UNWIND_HANDLER: u8 = 1 << 1;
pub const FLAG_CHAINED: u8 = 1 << 2;

/// The 4-byte header in front of a function's opcode array. Packed, and shared byte-for-byte with
/// the AOT code generator - field order and widths are part of the ABI, not an implementation
/// detail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindInfoHeader {
    pub version: u8,
    pub flags: u8,
    pub prolog_size: u8,
    pub opcode_count: u8,
    pub frame_register: u8,
    pub frame_offset: u8,
}

impl UnwindInfoHeader {
    /// Parse the 4-byte header from the start of a function's unwind-info blob.
    pub fn parse(bytes: [u8; 4]) -> UnwindInfoHeader {
        let version = bytes[0].get_bits(0..3);
        let flags = bytes[0].get_bits(3..8);
        UnwindInfoHeader {
            version,
            flags,
            prolog_size: bytes[1],
            opcode_count: bytes[2],
            frame_register: bytes[3].get_bits(0..4),
            frame_offset: bytes[3].get_bits(4..8),
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let mut byte0 = 0u8;
        byte0.set_bits(0..3, self.version);
        byte0.set_bits(3..8, self.flags);
        let mut byte3 = 0u8;
        byte3.set_bits(0..4, self.frame_register);
        byte3.set_bits(4..8, self.frame_offset);
        [byte0, self.prolog_size, self.opcode_count, byte3]
    }

    pub fn has_eh_handler(&self) -> bool {
        self.flags & FLAG_HAS_EH_HANDLER != 0
    }

    pub fn has_unwind_handler(&self) -> bool {
        self.flags & FLAG_HAS_UNWIND_HANDLER != 0
    }

    pub fn has_language_handler(&self) -> bool {
        self.has_eh_handler() || self.has_unwind_handler()
    }

    pub fn is_chained(&self) -> bool {
        self.flags & FLAG_CHAINED != 0
    }

    /// `frame_base = snapshot[frame_register] - 16 * frame_offset`, or just `rsp` when
    /// `uses_frame_register()` is false.
    pub fn uses_frame_register(&self) -> bool {
        self.frame_register != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    Root,
    CatchFunclet,
    FilterFunclet,
}

/// The extended-flags byte immediately following a function's opcode array (and optional handler
/// RVA). Two bits select the function kind; the remaining six bits are a union whose meaning
/// depends on that kind, since a root function's clause-table presence bits and a funclet's
/// owning-clause index are never both meaningful at once - this is how a 6-bit clause index and
/// two boolean flags both fit in a single byte alongside the kind selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtendedFlags(pub u8);

impl ExtendedFlags {
    pub fn function_kind(&self) -> FunctionKind {
        match self.0.get_bits(0..2) {
            0 => FunctionKind::Root,
            1 => FunctionKind::CatchFunclet,
            _ => FunctionKind::FilterFunclet,
        }
    }

    pub fn is_funclet(&self) -> bool {
        !matches!(self.function_kind(), FunctionKind::Root)
    }

    /// Valid only when `function_kind() == Root`.
    pub fn has_eh_clauses(&self) -> bool {
        self.0.get_bit(2)
    }

    /// Valid only when `function_kind() == Root`.
    pub fn has_associated_data(&self) -> bool {
        self.0.get_bit(3)
    }

    /// Valid only when `function_kind()` is a funclet kind: the index of the clause this funclet
    /// implements within its parent function's clause table.
    pub fn clause_index(&self) -> u8 {
        self.0.get_bits(2..8)
    }

    pub fn root() -> ExtendedFlags {
        let mut bits = 0u8;
        bits.set_bits(0..2, 0);
        ExtendedFlags(bits)
    }

    pub fn root_with_clauses(has_clauses: bool) -> ExtendedFlags {
        let mut bits = 0u8;
        bits.set_bits(0..2, 0);
        bits.set_bit(2, has_clauses);
        ExtendedFlags(bits)
    }

    pub fn funclet(kind: FunctionKind, clause_index: u8) -> ExtendedFlags {
        let mut bits = 0u8;
        bits.set_bits(0..2, if matches!(kind, FunctionKind::CatchFunclet) { 1 } else { 2 });
        bits.set_bits(2..8, clause_index);
        ExtendedFlags(bits)
    }
}

/// One decoded prolog-reversal opcode, plus how many 2-byte nodes it (and its operand) occupied in
/// the raw opcode stream - callers must advance the cursor by this amount even when skipping an
/// opcode whose `code_offset` lies past the current fault position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindOpcode {
    PushNonvol { reg: u8 },
    AllocSmall { size: u32 },
    AllocLarge { size: u32 },
    SetFramePointer,
    SaveNonvol { reg: u8, scaled_offset: u32 },
    SaveNonvolFar { reg: u8, offset: u32 },
    SaveXmm128 { reg: u8, scaled_offset: u32 },
    PushMachineFrame { has_error_code: bool },
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedOpcode {
    pub code_offset: u8,
    pub opcode: UnwindOpcode,
    /// Number of 2-byte nodes consumed from the stream by this opcode and its follow-up words.
    pub nodes_consumed: usize,
}

/// Opcodes are stored back-to-back as 2-byte little-endian nodes; read node `index` out of the raw
/// byte buffer rather than casting to `&[u16]`, since the buffer (sliced out of image memory) is
/// not guaranteed to be 2-byte aligned.
fn read_node(bytes: &[u8], index: usize) -> Option<u16> {
    let offset = index * 2;
    let pair = bytes.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([pair[0], pair[1]]))
}

/// Decode one opcode starting at node `index`. `bytes` is the function's raw opcode array;
/// returns `None` if `index` is out of range.
pub fn decode_opcode(bytes: &[u8], index: usize) -> Option<DecodedOpcode> {
    let head = read_node(bytes, index)?;
    let code_offset = (head & 0xff) as u8;
    let info = (head >> 8) as u8;
    let opcode_code = info.get_bits(0..4);
    let operand = info.get_bits(4..8);

    let (opcode, extra_nodes) = match opcode_code {
        0 => (UnwindOpcode::PushNonvol { reg: operand }, 0),
        1 => (UnwindOpcode::AllocSmall { size: (operand as u32 + 1) * 8 }, 0),
        2 => {
            if operand.get_bit(0) {
                let lo = read_node(bytes, index + 1)? as u32;
                let hi = read_node(bytes, index + 2)? as u32;
                (UnwindOpcode::AllocLarge { size: lo | (hi << 16) }, 2)
            } else {
                let scale = read_node(bytes, index + 1)? as u32;
                (UnwindOpcode::AllocLarge { size: scale * 8 }, 1)
            }
        }
        3 => (UnwindOpcode::SetFramePointer, 0),
        4 => {
            let scaled_offset = read_node(bytes, index + 1)? as u32;
            (UnwindOpcode::SaveNonvol { reg: operand, scaled_offset }, 1)
        }
        5 => {
            let lo = read_node(bytes, index + 1)? as u32;
            let hi = read_node(bytes, index + 2)? as u32;
            (UnwindOpcode::SaveNonvolFar { reg: operand, offset: lo | (hi << 16) }, 2)
        }
        6 => {
            let scaled_offset = read_node(bytes, index + 1)? as u32;
            (UnwindOpcode::SaveXmm128 { reg: operand, scaled_offset }, 1)
        }
        7 => (UnwindOpcode::PushMachineFrame { has_error_code: operand.get_bit(0) }, 0),
        _ => (UnwindOpcode::Unknown, 0),
    };

    Some(DecodedOpcode { code_offset, opcode, nodes_consumed: 1 + extra_nodes })
}

/// What immediately follows a function's opcode array: an optional language-handler RVA, the
/// one-byte `ExtendedFlags`, and - only when the flags say so - an associated-data RVA for that
/// handler. Returns the decoded trailer and how many bytes of `bytes` (which must start right
/// after the last opcode node) it consumed, so callers know where the clause table, if any,
/// begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindTrailer {
    pub handler_rva: Option<u32>,
    pub associated_data_rva: Option<u32>,
    pub extended_flags: ExtendedFlags,
    /// Total byte length of the clause table immediately following this trailer. Present exactly
    /// when `extended_flags` describes a root function with `has_eh_clauses` set - a funclet's
    /// extended-flags byte has no such bit (bits 2..8 there are the owning clause index instead),
    /// and a root function without clauses has no table to bound. Nothing else in the wire format
    /// gives the clause-table decoder a stopping point, since clauses are variable-width and
    /// self-describing only clause-by-clause, not as a whole table.
    pub clause_table_len: Option<u32>,
}

pub fn parse_trailer(bytes: &[u8], header: &UnwindInfoHeader) -> Option<(UnwindTrailer, usize)> {
    let mut cursor = 0usize;

    let handler_rva = if header.has_language_handler() {
        let word: [u8; 4] = bytes.get(cursor..cursor + 4)?.try_into().ok()?;
        cursor += 4;
        Some(u32::from_le_bytes(word))
    } else {
        None
    };

    let extended_flags = ExtendedFlags(*bytes.get(cursor)?);
    cursor += 1;

    let clause_table_len = if matches!(extended_flags.function_kind(), FunctionKind::Root) && extended_flags.has_eh_clauses() {
        let word: [u8; 4] = bytes.get(cursor..cursor + 4)?.try_into().ok()?;
        cursor += 4;
        Some(u32::from_le_bytes(word))
    } else {
        None
    };

    let associated_data_rva = if handler_rva.is_some() && extended_flags.has_associated_data() {
        let word: [u8; 4] = bytes.get(cursor..cursor + 4)?.try_into().ok()?;
        cursor += 4;
        Some(u32::from_le_bytes(word))
    } else {
        None
    };

    Some((UnwindTrailer { handler_rva, associated_data_rva, extended_flags, clause_table_len }, cursor))
}
