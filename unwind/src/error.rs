use core::fmt;

/// Sub-failures surfaced by the interpreter and clause-table decoder. The dispatcher treats most of
/// these as routine during an ordinary walk - a `RegistryMiss` is expected (assembly shims carry no
/// unwind info) - while the same condition in the chosen handler's own frame is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindError {
    /// The opcode count, clause count, or a variable-int encoding exceeded its sanity bound.
    MalformedUnwind,
    /// `code_address` matched no registered function table.
    RegistryMiss,
    /// The walk reached `rsp == 0` before popping a return address.
    EndOfStack,
}

impl fmt::Display for UnwindError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnwindError::MalformedUnwind => write!(f, "malformed unwind data"),
            UnwindError::RegistryMiss => write!(f, "no function table covers this address"),
            UnwindError::EndOfStack => write!(f, "reached the end of the stack"),
        }
    }
}

/// The loader's own, narrower, failure taxonomy. Kept separate from `UnwindError` because a
/// malformed exception directory is a boot-time condition the kernel may choose to tolerate
/// (booting with managed exceptions disabled), not something any dispatch-time caller can hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    /// The directory's size is not a multiple of `size_of::<FunctionDescriptor>()`.
    MalformedDirectory,
    /// The directory is empty (size == 0); there is nothing to register.
    EmptyDirectory,
    /// The registry had no free slot left for this image.
    RegistryFull,
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoaderError::MalformedDirectory => write!(f, "exception directory size is not a multiple of 12"),
            LoaderError::EmptyDirectory => write!(f, "exception directory is empty"),
            LoaderError::RegistryFull => write!(f, "function table registry is at capacity"),
        }
    }
}
