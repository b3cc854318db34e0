//! The managed-exception core built on top of `unwind`'s primitives: the two-pass dispatcher, the
//! image-memory and function-chain walking glue between it and a loaded PE image, hardware-fault
//! translation, per-fiber rethrow bookkeeping, GC stack-root enumeration, and the assembly
//! trampolines real `throw`/fault/rethrow sites and funclets actually run through.
//!
//! Everything above `trampoline.rs` is pure data and callbacks and is exercised with hand-built
//! fixtures in each module's own tests; `trampoline.rs`/`trampoline.s` are the one part of this
//! crate that cannot be, since they are the boundary where a register snapshot stops being a Rust
//! value and starts being the actual machine state of a thread that is about to jump somewhere.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod dispatcher;
pub mod error;
pub mod gc;
pub mod hw_fault;
pub mod image;
pub mod pe_loader;
pub mod record;
pub mod rethrow;
pub mod trampoline;

pub use dispatcher::{DispatchResult, ExceptionDispatcher, ExceptionTypeSystem, FuncletInvoker, ResumeTarget};
pub use error::{FatalReason, FrameTrace, TraceFrame, MAX_TRACE_FRAMES};
pub use gc::{GcRootEnumerator, GcSlot, GcSlotTable, GcTableSource, SafePoint, SlotBase};
pub use hw_fault::{ExceptionAllocator, ExceptionKind, HardwareFaultBridge};
pub use image::{DirectMemory, FrameHandlerInfo, ImageMemory};
pub use pe_loader::load_exception_directory;
pub use record::ExceptionRecord;
pub use rethrow::{FiberId, RethrowRecord, RethrowState, DEFAULT_FIBER_CAPACITY};
pub use trampoline::{install, RuntimeSupport};
