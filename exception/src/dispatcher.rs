//! The two-pass exception dispatcher: pass 1 searches caller frames for a matching clause without
//! touching memory beyond what unwinding itself requires, pass 2 re-walks from the throw site and
//! runs every Finally/Fault clause up to and including the handler's frame, and `resume` synthesizes
//! the `RegisterSnapshot` `AsmTrampolines` jumps the thread into. Everything here is pure data and
//! callbacks - no assembly, no real stack writes - so it can be exercised with hand-built fixtures.

use crate::{
    error::{FatalReason, FrameTrace, TraceFrame},
    image::{self, ImageMemory, MAX_CLAUSE_TABLE_BYTES},
    rethrow::{FiberId, RethrowState},
};
use hal::VAddr;
use unwind::{
    clause::{find_cleanup_clauses_from, find_handler_clause, ClauseTable, ExceptionClause},
    function_table::FunctionTableLookup,
    interpreter::RegisterSnapshot,
    ExceptionHandle, TypeHandle,
};

/// The managed type system's two queries into this crate: what type an exception object carries,
/// and whether one type is assignable to another. Kept as a trait rather than a concrete type so
/// the dispatcher never needs to know how the GC represents a type descriptor.
pub trait ExceptionTypeSystem {
    fn type_of(&self, exception: ExceptionHandle) -> TypeHandle;
    fn is_assignable(&self, from: TypeHandle, to: TypeHandle) -> bool;
}

/// The dispatcher's only way to actually run managed code: filter predicates and Finally/Fault
/// handlers, both invoked through `AsmTrampolines` on the other side of this trait.
pub trait FuncletInvoker {
    /// Run a `Filter` clause's filter funclet. Returns `0` to keep searching, `1` to select it.
    fn invoke_filter(&self, filter_address: VAddr, frame_pointer: VAddr, exception: ExceptionHandle) -> i32;
    fn invoke_finally(&self, handler_address: VAddr, frame_pointer: VAddr);
}

/// Upper bound on frames walked in a single pass, per the design notes - a safety net against a
/// corrupt or cyclic unwind chain, not a limit expected to matter for well-formed code.
const MAX_FRAMES: usize = 100;

/// Distance below the handler frame's RBP that the synthesized catch-funclet RSP is positioned,
/// per the design notes: fixed rather than derived, since nothing in the clause/unwind data model
/// records a funclet's own frame size.
const FUNCLET_FRAME_RESERVE: usize = 0x100;

/// Everything pass 2 and `resume` need about the frame pass 1 picked: where its function starts,
/// the frame pointer a funclet entered there would see, and the clause that matched.
#[derive(Clone, Copy, Debug)]
struct HandlerLocation {
    function_begin: VAddr,
    frame_pointer: VAddr,
    clause: ExceptionClause,
    clause_index: usize,
}

/// One successfully-walked frame, normalised so pass 1 and pass 2 share the same stepping logic
/// regardless of whether it came from a plain `unwind_frame` or a funclet-to-parent redirect.
struct WalkedFrame {
    function_begin: VAddr,
    function_end: VAddr,
    frame_pointer: VAddr,
    fault_offset: u32,
    start_index: usize,
    clause_table_addr: Option<VAddr>,
    clause_table_len: u32,
}

/// Advance `snapshot` by one frame, returning `None` for a leaf frame the registry has no table
/// for (the return address has already been popped by `image::unwind_frame`). A funclet frame is
/// transparently redirected to its parent: the returned `WalkedFrame` describes the parent, and
/// `snapshot` is left holding a continuation state usable as the next call's input regardless of
/// whether a match is found in the parent.
fn walk_step(
    lookup: &dyn FunctionTableLookup,
    memory: &dyn ImageMemory,
    snapshot: &mut RegisterSnapshot,
    start_index_override: usize,
) -> Result<Option<WalkedFrame>, FatalReason> {
    if snapshot.rip == 0 {
        return Err(FatalReason::UnhandledException);
    }

    let code_address = VAddr::new(snapshot.rip as usize);
    let pre_frame_pointer = VAddr::new(snapshot.rbp as usize);
    let (handler_info, _shadow) =
        image::unwind_frame(lookup, memory, code_address, snapshot).map_err(FatalReason::MalformedHandlerFrame)?;

    let Some(info) = handler_info else {
        return Ok(None);
    };

    if info.extended_flags.is_funclet() {
        let clause_index = info.extended_flags.clause_index() as usize;
        let parent = lookup.find_main_function(info.image_base).ok_or(FatalReason::UnhandledException)?;

        let mut parent_snapshot = RegisterSnapshot::zeroed();
        parent_snapshot.rbp = pre_frame_pointer.as_u64();
        parent_snapshot.rsp = pre_frame_pointer.as_u64();
        let (parent_info, _shadow) = image::unwind_known_frame(memory, parent, info.image_base, u32::MAX, &mut parent_snapshot)
            .map_err(FatalReason::MalformedHandlerFrame)?;
        let parent_info = parent_info.ok_or(FatalReason::UnhandledException)?;

        let owning_try_start = clause_table_entry(memory, &parent_info, clause_index).map_err(FatalReason::MalformedHandlerFrame)?;
        let fault_offset = owning_try_start.map(|try_start| try_start + 1).unwrap_or(0);

        *snapshot = parent_snapshot;

        return Ok(Some(WalkedFrame {
            function_begin: parent_info.function_begin(),
            function_end: parent_info.function_end(),
            frame_pointer: pre_frame_pointer,
            fault_offset,
            start_index: clause_index + 1,
            clause_table_addr: parent_info.clause_table_addr,
            clause_table_len: parent_info.clause_table_len.unwrap_or(0),
        }));
    }

    let fault_offset = code_address.offset_from(info.function_begin()).unwrap_or(0) as u32;
    Ok(Some(WalkedFrame {
        function_begin: info.function_begin(),
        function_end: info.function_end(),
        frame_pointer: pre_frame_pointer,
        fault_offset,
        start_index: start_index_override,
        clause_table_addr: info.clause_table_addr,
        clause_table_len: info.clause_table_len.unwrap_or(0),
    }))
}

/// Look up clause `index`'s `try_start` in a frame's clause table, for the synthetic fault offset
/// a funclet redirect needs. `Ok(None)` covers both "no clause table" and "index not present" -
/// both leave the caller falling back to offset 0, which is always outside every real try range and
/// so simply fails to match anything rather than fabricating a plausible-looking hit.
fn clause_table_entry(
    memory: &dyn ImageMemory,
    info: &image::FrameHandlerInfo,
    index: usize,
) -> Result<Option<u32>, unwind::UnwindError> {
    let (Some(addr), Some(len)) = (info.clause_table_addr, info.clause_table_len) else {
        return Ok(None);
    };
    let mut storage = [0u8; MAX_CLAUSE_TABLE_BYTES];
    let bytes = image::read_clause_table_bytes(memory, addr, len, &mut storage)?;
    let table = ClauseTable::new(bytes);
    for item in table.iter() {
        let (found_index, clause) = item?;
        if found_index == index {
            return Ok(Some(clause.try_start));
        }
    }
    Ok(None)
}

/// Pass 1: walk from `snapshot` (consumed by value; the caller keeps its own copy for pass 2) until
/// a Typed or Filter clause matches, starting the very first frame's scan at `start_index` (nonzero
/// only for a rethrow). Returns the handler location and how many `walk_step` calls it took to reach
/// it, so pass 2 can replicate exactly the same walk, plus the trace of every frame visited along
/// the way - on a fatal outcome this is the diagnostic §7 asks be printed before halting.
fn pass1_search(
    lookup: &dyn FunctionTableLookup,
    memory: &dyn ImageMemory,
    types: &dyn ExceptionTypeSystem,
    invoker: &dyn FuncletInvoker,
    exception: ExceptionHandle,
    mut snapshot: RegisterSnapshot,
    start_index: usize,
) -> Result<(HandlerLocation, usize, FrameTrace), (FatalReason, FrameTrace)> {
    let exception_type = types.type_of(exception);
    let mut trace = FrameTrace::empty();

    for call_count in 1..=MAX_FRAMES {
        let rip = snapshot.rip;
        let rbp = snapshot.rbp;

        let first_start_index = if call_count == 1 { start_index } else { 0 };
        let frame = match walk_step(lookup, memory, &mut snapshot, first_start_index) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(reason) => return Err((reason, trace)),
        };

        trace.push(TraceFrame { rip, rbp, function_range: Some((frame.function_begin.as_u64(), frame.function_end.as_u64())) });

        let (Some(addr), len) = (frame.clause_table_addr, frame.clause_table_len) else { continue };
        if len == 0 {
            continue;
        }

        let mut storage = [0u8; MAX_CLAUSE_TABLE_BYTES];
        let bytes = match image::read_clause_table_bytes(memory, addr, len, &mut storage) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        let table = ClauseTable::new(bytes);

        let found = find_handler_clause(
            table,
            frame.fault_offset,
            frame.start_index,
            exception_type,
            |from, to| types.is_assignable(from, to),
            |clause| {
                let filter_address = frame.function_begin + clause.filter_offset.unwrap_or(0) as u64;
                invoker.invoke_filter(filter_address, frame.frame_pointer, exception)
            },
        );

        match found {
            Ok(Some((clause, index))) => {
                return Ok((
                    HandlerLocation { function_begin: frame.function_begin, frame_pointer: frame.frame_pointer, clause, clause_index: index },
                    call_count,
                    trace,
                ))
            }
            Ok(None) => continue,
            Err(_) => continue,
        }
    }

    Err((FatalReason::MaxFrameReached, trace))
}

/// Pass 2: replay the same `calls_to_handler` walk steps pass 1 took from the original throw
/// snapshot, invoking every Finally/Fault clause covering each frame's fault offset, innermost
/// first.
fn pass2_cleanup(
    lookup: &dyn FunctionTableLookup,
    memory: &dyn ImageMemory,
    invoker: &dyn FuncletInvoker,
    mut snapshot: RegisterSnapshot,
    calls_to_handler: usize,
) -> Result<(), FatalReason> {
    for _ in 1..=calls_to_handler {
        let Some(frame) = walk_step(lookup, memory, &mut snapshot, 0)? else {
            continue;
        };

        let (Some(addr), len) = (frame.clause_table_addr, frame.clause_table_len) else { continue };
        if len == 0 {
            continue;
        }

        let mut storage = [0u8; MAX_CLAUSE_TABLE_BYTES];
        let Ok(bytes) = image::read_clause_table_bytes(memory, addr, len, &mut storage) else { continue };
        let table = ClauseTable::new(bytes);

        let mut cleanup = [zero_clause(); unwind::clause::MAX_CLAUSES_PER_FUNCTION];
        let Ok(count) = find_cleanup_clauses_from(table, frame.fault_offset, frame.start_index, &mut cleanup) else { continue };

        for clause in &cleanup[..count] {
            let handler_address = frame.function_begin + clause.handler_offset as u64;
            invoker.invoke_finally(handler_address, frame.frame_pointer);
        }
    }

    Ok(())
}

fn zero_clause() -> ExceptionClause {
    ExceptionClause {
        kind: unwind::clause::ClauseKind::Finally,
        try_start: 0,
        try_end: 0,
        handler_offset: 0,
        filter_offset: None,
        catch_type_handle: None,
        leave_target_offset: None,
    }
}

/// What `AsmTrampolines` does with a completed dispatch: either reload registers from a synthesized
/// snapshot and jump, or print a trace and halt.
#[derive(Debug)]
pub enum DispatchResult {
    Resume(ResumeTarget),
    Fatal(FatalReason, FrameTrace),
}

/// The catch funclet's entry state, plus the value the trampoline must write to `[snapshot.rsp]`
/// before jumping - this crate never writes to the real stack itself, only assembly does.
///
/// `trampoline.s` reads `leave_return_address` at a fixed offset past the end of `snapshot`
/// (`RESUME_LEAVE_RIP`), so the field order and the absence of padding are load-bearing -
/// `#[repr(C)]` plus the assertions below keep that honest.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ResumeTarget {
    pub snapshot: RegisterSnapshot,
    pub leave_return_address: u64,
}

const _: () = {
    assert!(core::mem::offset_of!(ResumeTarget, leave_return_address) == core::mem::size_of::<RegisterSnapshot>());
    assert!(core::mem::size_of::<ResumeTarget>() == core::mem::size_of::<RegisterSnapshot>() + 8);
};

fn synthesize_resume(handler: &HandlerLocation, exception: ExceptionHandle) -> ResumeTarget {
    let mut snapshot = RegisterSnapshot::zeroed();
    snapshot.rip = (handler.function_begin + handler.clause.handler_offset as u64).as_u64();
    snapshot.rbp = handler.frame_pointer.as_u64();
    snapshot.rcx = exception.as_raw();
    snapshot.rdx = handler.frame_pointer.as_u64();
    snapshot.rsp = (handler.frame_pointer - FUNCLET_FRAME_RESERVE).as_u64();

    let leave_target = handler.clause.leave_target_offset.unwrap_or(0);
    let leave_return_address = (handler.function_begin + leave_target as u64).as_u64();

    ResumeTarget { snapshot, leave_return_address }
}

/// The two-pass dispatcher. Stateless - every collaborator it needs is passed in, so the kernel's
/// single live `FunctionTableRegistry`/`RethrowState` instances are never duplicated here.
pub struct ExceptionDispatcher;

impl ExceptionDispatcher {
    /// Entry point for a managed `throw` or a hardware fault already turned into an exception
    /// object by `HardwareFaultBridge`. `throw_snapshot` is the full register state captured at the
    /// throw site, with `rip` already set to the instruction to resume unwinding from.
    pub fn dispatch_throw<const N: usize>(
        lookup: &dyn FunctionTableLookup,
        memory: &dyn ImageMemory,
        types: &dyn ExceptionTypeSystem,
        invoker: &dyn FuncletInvoker,
        rethrow_state: &RethrowState<N>,
        fiber: FiberId,
        exception: ExceptionHandle,
        throw_snapshot: RegisterSnapshot,
    ) -> DispatchResult {
        run_dispatch(lookup, memory, types, invoker, rethrow_state, fiber, exception, throw_snapshot, 0)
    }

    /// Entry point for a bare `rethrow`: pulls the original throw site and the next clause index to
    /// resume search from out of `rethrow_state`. Fatal if `fiber` has no outstanding exception.
    pub fn dispatch_rethrow<const N: usize>(
        lookup: &dyn FunctionTableLookup,
        memory: &dyn ImageMemory,
        types: &dyn ExceptionTypeSystem,
        invoker: &dyn FuncletInvoker,
        rethrow_state: &RethrowState<N>,
        fiber: FiberId,
    ) -> DispatchResult {
        let Some(record) = rethrow_state.current(fiber) else {
            return DispatchResult::Fatal(FatalReason::RethrowWithoutException, FrameTrace::empty());
        };

        let mut throw_snapshot = RegisterSnapshot::zeroed();
        throw_snapshot.rip = record.throw_rip;
        throw_snapshot.rsp = record.throw_rsp;
        throw_snapshot.rbp = record.throw_rbp;

        run_dispatch(
            lookup,
            memory,
            types,
            invoker,
            rethrow_state,
            fiber,
            record.exception,
            throw_snapshot,
            record.next_clause_index,
        )
    }

    /// Clear a fiber's rethrow record on leaving a catch block, normally or via a further unwind.
    pub fn leave_catch<const N: usize>(rethrow_state: &RethrowState<N>, fiber: FiberId) {
        rethrow_state.clear(fiber);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_dispatch<const N: usize>(
    lookup: &dyn FunctionTableLookup,
    memory: &dyn ImageMemory,
    types: &dyn ExceptionTypeSystem,
    invoker: &dyn FuncletInvoker,
    rethrow_state: &RethrowState<N>,
    fiber: FiberId,
    exception: ExceptionHandle,
    throw_snapshot: RegisterSnapshot,
    start_index: usize,
) -> DispatchResult {
    let (handler, calls_to_handler, trace) = match pass1_search(lookup, memory, types, invoker, exception, throw_snapshot, start_index) {
        Ok(handler) => handler,
        Err((reason, trace)) => {
            tracing::warn!(reason = %reason, "no handler found for exception");
            return DispatchResult::Fatal(reason, trace);
        }
    };

    if let Err(reason) = pass2_cleanup(lookup, memory, invoker, throw_snapshot, calls_to_handler) {
        tracing::warn!(reason = %reason, "cleanup pass failed before reaching handler frame");
        return DispatchResult::Fatal(reason, trace);
    }

    rethrow_state.record(fiber, exception, throw_snapshot.rip, throw_snapshot.rsp, throw_snapshot.rbp, handler.clause_index);

    tracing::trace!(rip = handler.function_begin.as_u64(), "resuming into catch funclet");
    DispatchResult::Resume(synthesize_resume(&handler, exception))
}
