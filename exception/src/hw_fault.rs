//! Maps CPU interrupt vectors and their error codes onto language-level exception kinds, so a
//! hardware fault can be handed to the same dispatcher a managed `throw` uses. Allocating the
//! actual exception object is the GC's job, not this crate's - `HardwareFaultBridge::dispatch`
//! takes an `ExceptionAllocator` callback rather than reaching for an allocator of its own.

use crate::record::{ExceptionRecord, FLAG_NONCONTINUABLE};
use bit_field::BitField;
use hal::VAddr;
use poplar_util::BinaryPrettyPrint;
use unwind::ExceptionHandle;

pub const VECTOR_DIVIDE_ERROR: u8 = 0;
pub const VECTOR_BREAKPOINT: u8 = 3;
pub const VECTOR_OVERFLOW: u8 = 4;
pub const VECTOR_BOUND_RANGE: u8 = 5;
pub const VECTOR_INVALID_OPCODE: u8 = 6;
pub const VECTOR_GENERAL_PROTECTION: u8 = 13;
pub const VECTOR_PAGE_FAULT: u8 = 14;
pub const VECTOR_ALIGNMENT_CHECK: u8 = 17;

/// Base code for vectors with no dedicated managed exception kind: `0xE0000000 | vector`.
const SYNTHETIC_CODE_BASE: u32 = 0xE000_0000;

/// The managed-level kind a hardware fault is surfaced as. Distinct from `ExceptionRecord::code`
/// (a wire-level numeric code) so an allocator can match on it without decoding the record.
///
/// `OutOfRange` and `StackOverflow` are never produced by `dispatch` itself - x86-64 has no vector
/// dedicated to either condition, and recognising a guard-page page fault as stack exhaustion needs
/// the faulting address compared against the thread's own guard region, which this crate does not
/// track. They exist here so managed code's own bounds-check and stack-probe throw sites (which
/// bypass this bridge and call the dispatcher directly) share one kind vocabulary with hardware
/// faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    DivideByZero,
    Breakpoint,
    Overflow,
    BoundRange,
    IllegalInstruction,
    AccessViolation,
    NullDereference,
    OutOfRange,
    StackOverflow,
    Alignment,
    Other(u8),
}

/// Allocates the GC-managed exception object for a hardware fault. Implemented by the kernel's
/// runtime support, which owns the heap; this crate only decides *what* to allocate.
pub trait ExceptionAllocator {
    fn allocate(&self, kind: ExceptionKind, record: &ExceptionRecord) -> ExceptionHandle;
}

pub struct HardwareFaultBridge;

impl HardwareFaultBridge {
    /// `error_code` is the CPU-pushed error code for vectors that have one (0 otherwise);
    /// `faulting_address` is CR2 for a page fault and the faulting instruction's address otherwise.
    pub fn dispatch(
        vector: u8,
        error_code: u64,
        faulting_address: VAddr,
        allocator: &dyn ExceptionAllocator,
    ) -> (ExceptionHandle, ExceptionRecord) {
        tracing::debug!(vector, error_code = %BinaryPrettyPrint(error_code), "translating hardware fault");

        let (kind, code, parameters): (ExceptionKind, u32, &[u64]) = match vector {
            VECTOR_DIVIDE_ERROR => (ExceptionKind::DivideByZero, 0x8000_0000, &[]),
            VECTOR_BREAKPOINT => (ExceptionKind::Breakpoint, 0x8000_0003, &[]),
            VECTOR_OVERFLOW => (ExceptionKind::Overflow, 0x8000_0004, &[]),
            VECTOR_BOUND_RANGE => (ExceptionKind::BoundRange, 0x8000_0005, &[]),
            VECTOR_INVALID_OPCODE => (ExceptionKind::IllegalInstruction, 0x8000_0006, &[]),
            VECTOR_GENERAL_PROTECTION => (ExceptionKind::AccessViolation, 0x8000_000d, &[]),
            VECTOR_ALIGNMENT_CHECK => (ExceptionKind::Alignment, 0x8000_0011, &[]),
            other => (ExceptionKind::Other(other), SYNTHETIC_CODE_BASE | other as u32, &[]),
        };

        let record = if vector == VECTOR_PAGE_FAULT {
            let write = error_code.get_bit(1) as u64;
            ExceptionRecord::new(0x8000_000e, FLAG_NONCONTINUABLE, faulting_address, &[write, faulting_address.as_u64()])
        } else {
            ExceptionRecord::new(code, FLAG_NONCONTINUABLE, faulting_address, parameters)
        };

        let kind = if vector == VECTOR_PAGE_FAULT {
            if faulting_address.as_u64() == 0 { ExceptionKind::NullDereference } else { ExceptionKind::AccessViolation }
        } else {
            kind
        };
        let exception = allocator.allocate(kind, &record);
        (exception, record)
    }
}
