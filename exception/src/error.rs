use core::fmt;
use unwind::UnwindError;

/// One entry of the truncated frame trace printed on an unhandled exception (§7): the code address
/// pass 1 was at in that frame, the frame pointer snapshotted there, and - when the address matched
/// a registered function - its `[begin, end)` range within its image. `function_range` is `None`
/// for a leaf frame the registry has no table for; the trace still records its raw address.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceFrame {
    pub rip: u64,
    pub rbp: u64,
    pub function_range: Option<(u64, u64)>,
}

/// Bounded, outermost-first record of the frames pass 1 walked before giving up. Fixed capacity
/// rather than a `Vec`: this crate is `no_std` and must not allocate on the fault path, and §7 only
/// asks for a *truncated* trace, so silently dropping frames past the capacity is the intended
/// behaviour, not a bug to work around.
pub const MAX_TRACE_FRAMES: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct FrameTrace {
    frames: [TraceFrame; MAX_TRACE_FRAMES],
    len: usize,
}

impl FrameTrace {
    pub const fn empty() -> FrameTrace {
        FrameTrace { frames: [TraceFrame { rip: 0, rbp: 0, function_range: None }; MAX_TRACE_FRAMES], len: 0 }
    }

    pub fn push(&mut self, frame: TraceFrame) {
        if self.len < self.frames.len() {
            self.frames[self.len] = frame;
            self.len += 1;
        }
    }

    pub fn as_slice(&self) -> &[TraceFrame] {
        &self.frames[..self.len]
    }
}

impl Default for FrameTrace {
    fn default() -> FrameTrace {
        FrameTrace::empty()
    }
}

/// Why `fatal` was called. Logged, then the CPU halts - there is no outer handler for a failure
/// in the unwinder itself.
#[derive(Debug, Clone, Copy)]
pub enum FatalReason {
    UnhandledException,
    MalformedHandlerFrame(UnwindError),
    RethrowWithoutException,
    MaxFrameReached,
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FatalReason::UnhandledException => write!(f, "unhandled exception"),
            FatalReason::MalformedHandlerFrame(error) => write!(f, "malformed unwind data in handler frame: {error}"),
            FatalReason::RethrowWithoutException => write!(f, "rethrow with no outstanding exception"),
            FatalReason::MaxFrameReached => write!(f, "exceeded maximum unwind frame count"),
        }
    }
}
