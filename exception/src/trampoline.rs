//! `AsmTrampolines`: the four entry points real machine code calls into, and the glue that wires
//! them to the pure-data dispatcher in `dispatcher.rs`. The actual register capture/reload and
//! funclet calls live in `trampoline.s`, assembled in with `global_asm!` exactly as
//! `kernel_x86_64::task` pulls in its context-switch assembly - the alternative, inline `asm!` big
//! enough to save every GPR, reads far worse than a dedicated `.s` file with real labels.
//!
//! This module owns no state of its own beyond `RUNTIME`: the one process-wide set of collaborators
//! (`FunctionTableLookup`, `ImageMemory`, the type system, the funclet invoker, `RethrowState`) the
//! assembly needs but can't construct, installed once during kernel init.

use crate::{
    dispatcher::{DispatchResult, ExceptionDispatcher, ExceptionTypeSystem, FuncletInvoker, ResumeTarget},
    hw_fault::{ExceptionAllocator, HardwareFaultBridge},
    image::ImageMemory,
    rethrow::{FiberId, RethrowState, DEFAULT_FIBER_CAPACITY},
};
use core::arch::global_asm;
use hal::VAddr;
use poplar_util::InitGuard;
use unwind::{function_table::FunctionTableLookup, interpreter::RegisterSnapshot, ExceptionHandle};

global_asm!(include_str!("trampoline.s"));

unsafe extern "C" {
    /// Captures the full register state at a `throw` site, with `rip` set to the return address,
    /// and calls `throw_dispatch_shim`. Never returns normally: either jumps into a catch funclet
    /// or halts via `fatal_halt_shim`.
    pub fn throw_entry() -> !;

    /// Same shape as `throw_entry`, but reached from the interrupt stub for a CPU exception vector
    /// with `rdi`/`rsi`/`rdx` already holding the vector, error code, and faulting address. `rip`
    /// in the captured snapshot is the faulting instruction, not a return address.
    pub fn hardware_fault_entry() -> !;

    /// Same shape as `throw_entry`, with no argument - the exception reference comes out of
    /// `RethrowState` instead of a register.
    pub fn rethrow_entry() -> !;

    /// Calls the filter funclet at `filter_address` with the ABI it expects (parent frame pointer,
    /// exception handle) and returns its `i32` result.
    pub fn invoke_filter_trampoline(filter_address: u64, frame_pointer: u64, exception: u64) -> i32;

    /// Calls the Finally/Fault handler funclet at `handler_address` with the parent frame pointer.
    pub fn invoke_finally_trampoline(handler_address: u64, frame_pointer: u64);
}

/// Everything the assembly entry points need but cannot construct themselves: the live
/// `FunctionTableRegistry`, a view onto the loaded image's bytes, the managed type system, and the
/// per-fiber rethrow table. Implemented once by the kernel's runtime support and installed with
/// `install`.
pub trait RuntimeSupport: Sync {
    fn function_table(&self) -> &dyn FunctionTableLookup;
    fn image_memory(&self) -> &dyn ImageMemory;
    fn type_system(&self) -> &dyn ExceptionTypeSystem;
    fn exception_allocator(&self) -> &dyn ExceptionAllocator;
    fn rethrow_state(&self) -> &RethrowState<DEFAULT_FIBER_CAPACITY>;
    /// The fiber identifier for the thread currently executing, read from whatever per-CPU or
    /// per-task storage the scheduler keeps it in.
    fn current_fiber(&self) -> FiberId;
}

static RUNTIME: InitGuard<&'static dyn RuntimeSupport> = InitGuard::uninit();

/// Install the kernel's runtime support. Must be called exactly once, before any code that might
/// throw, fault, or rethrow runs.
///
/// ### Panics
/// Panics if called more than once.
pub fn install(support: &'static dyn RuntimeSupport) {
    RUNTIME.initialize(support);
}

struct AsmFuncletInvoker;

impl FuncletInvoker for AsmFuncletInvoker {
    fn invoke_filter(&self, filter_address: VAddr, frame_pointer: VAddr, exception: ExceptionHandle) -> i32 {
        unsafe { invoke_filter_trampoline(filter_address.as_u64(), frame_pointer.as_u64(), exception.as_raw()) }
    }

    fn invoke_finally(&self, handler_address: VAddr, frame_pointer: VAddr) {
        unsafe { invoke_finally_trampoline(handler_address.as_u64(), frame_pointer.as_u64()) }
    }
}

fn dispatch(exception: ExceptionHandle, snapshot: RegisterSnapshot) -> DispatchResult {
    let runtime = *RUNTIME.get();
    let invoker = AsmFuncletInvoker;
    ExceptionDispatcher::dispatch_throw(
        runtime.function_table(),
        runtime.image_memory(),
        runtime.type_system(),
        &invoker,
        runtime.rethrow_state(),
        runtime.current_fiber(),
        exception,
        snapshot,
    )
}

/// Called by `trampoline.s` from `throw_entry` with the just-captured snapshot. `snapshot.rcx`
/// holds the exception handle the throw site placed there before the call.
#[unsafe(no_mangle)]
extern "C" fn throw_dispatch_shim(snapshot: *mut RegisterSnapshot) -> *const ResumeTarget {
    let captured = unsafe { *snapshot };
    let exception = ExceptionHandle::from_raw(captured.rcx);
    handle_result(dispatch(exception, captured), snapshot)
}

/// Called by `trampoline.s` from `hardware_fault_entry`. The vector, error code, and faulting
/// address arrive in the snapshot's `rdi`/`rsi`/`rdx` slots (where the interrupt stub placed them
/// before the call that reached here), matching `HardwareFaultBridge::dispatch`'s own signature.
#[unsafe(no_mangle)]
extern "C" fn hardware_fault_dispatch_shim(snapshot: *mut RegisterSnapshot) -> *const ResumeTarget {
    let captured = unsafe { *snapshot };
    let runtime = *RUNTIME.get();
    let vector = captured.rdi as u8;
    let error_code = captured.rsi;
    let faulting_address = VAddr::new(captured.rdx as usize);
    let (exception, _record) = HardwareFaultBridge::dispatch(vector, error_code, faulting_address, runtime.exception_allocator());
    handle_result(dispatch(exception, captured), snapshot)
}

/// Called by `trampoline.s` from `rethrow_entry`. The captured snapshot's own register state is
/// unused - `ExceptionDispatcher::dispatch_rethrow` reconstructs the throw-site snapshot from
/// `RethrowState` itself. The buffer it points to is still reused as the output slot for the
/// resumed snapshot, same as the other two entries.
#[unsafe(no_mangle)]
extern "C" fn rethrow_dispatch_shim(snapshot: *mut RegisterSnapshot) -> *const ResumeTarget {
    let runtime = *RUNTIME.get();
    let invoker = AsmFuncletInvoker;
    let result = ExceptionDispatcher::dispatch_rethrow(
        runtime.function_table(),
        runtime.image_memory(),
        runtime.type_system(),
        &invoker,
        runtime.rethrow_state(),
        runtime.current_fiber(),
    );
    handle_result(result, snapshot)
}

/// Turn a completed dispatch into what `trampoline.s`'s shared resume tail expects: a pointer to a
/// `ResumeTarget` it can read `RegisterSnapshot` fields and `leave_return_address` out of.
///
/// On `Resume`, the target is written back into the same on-stack buffer `trampoline.s` captured
/// the throw-site snapshot into (`snapshot`, still `FRAME_SIZE` bytes reserved and exclusively
/// owned by this thread's call - never shared with any other CPU or fiber, so there is nothing to
/// lock). `RegisterSnapshot` and `ResumeTarget` share the same leading layout, and
/// `ResumeTarget::leave_return_address` lands exactly where the original captured return address
/// used to sit (already copied out into `captured.rip` before this ever runs), so the write never
/// touches memory still needed for anything else.
fn handle_result(result: DispatchResult, snapshot: *mut RegisterSnapshot) -> *const ResumeTarget {
    match result {
        DispatchResult::Resume(target) => unsafe {
            let out = snapshot.cast::<ResumeTarget>();
            out.write(target);
            out.cast_const()
        },
        DispatchResult::Fatal(reason, trace) => {
            tracing::error!(%reason, "unhandled exception, halting");
            for (depth, frame) in trace.as_slice().iter().enumerate() {
                match frame.function_range {
                    Some((begin, end)) => {
                        tracing::error!(depth, rip = frame.rip, rbp = frame.rbp, function_begin = begin, function_end = end, "frame")
                    }
                    None => tracing::error!(depth, rip = frame.rip, rbp = frame.rbp, "frame (no owning function found)"),
                }
            }
            fatal_halt()
        }
    }
}

#[unsafe(no_mangle)]
extern "C" fn fatal_halt_shim() -> ! {
    fatal_halt()
}

fn fatal_halt() -> ! {
    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}
