//! The data model and pure, stateless algorithms behind Windows-style x64 stack unwinding: the
//! per-image function-table registry, the packed-opcode prolog interpreter, and the
//! exception-clause table decoder. This crate owns no dispatch policy - it has no opinion on what
//! a "handler" or a "fault" means to managed code - that lives in the `exception` crate, which
//! composes these primitives into the two-pass dispatcher.
//!
//! Every type here that is shared byte-for-byte with the AOT code generator or with assembly
//! (`FunctionDescriptor`, `UnwindInfoHeader`'s wire encoding, `RegisterSnapshot`) carries a
//! `const` size/offset assertion next to its definition rather than relying on documentation to
//! keep the Rust and ABI views in sync.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod clause;
pub mod descriptor;
pub mod error;
pub mod function_table;
pub mod handle;
pub mod interpreter;
pub mod unwind_info;

pub use clause::{ClauseTable, ExceptionClause, ClauseKind};
pub use descriptor::FunctionDescriptor;
pub use error::{LoaderError, UnwindError};
pub use function_table::{FunctionTableLookup, FunctionTableRegistry};
pub use handle::{ExceptionHandle, TypeHandle};
pub use interpreter::{GcShadow, LanguageHandler, RegisterSnapshot, UnwindInterpreter};
pub use unwind_info::{DecodedOpcode, ExtendedFlags, FunctionKind, UnwindInfoHeader, UnwindOpcode, UnwindTrailer};
