/// A non-owning reference to a managed exception object. The object itself is a GC-managed heap
/// allocation owned by the runtime, not by this crate: the unwinder never dereferences it, only
/// carries it between the throw site, `is_assignable`, filter funclets, and the synthesized `RCX`
/// at resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ExceptionHandle(pub u64);

impl ExceptionHandle {
    pub const fn from_raw(address: u64) -> ExceptionHandle {
        ExceptionHandle(address)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// A non-owning reference to a type descriptor, as embedded in a `Typed` clause or carried
/// alongside an `ExceptionHandle`. Opaque to this crate: two handles are only ever compared
/// through the externally-supplied `is_assignable` predicate, never by address equality (a type
/// handle is not required to be unique per type, only stable for the lifetime of the image).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct TypeHandle(pub u64);

impl TypeHandle {
    pub const fn from_raw(address: u64) -> TypeHandle {
        TypeHandle(address)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// A zero handle means "catch-all" in a `Typed` clause - it never needs to reach
    /// `is_assignable` because it matches unconditionally.
    pub const fn is_catch_all(self) -> bool {
        self.0 == 0
    }
}
