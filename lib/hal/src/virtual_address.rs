use cfg_if::cfg_if;
use core::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// Represents a virtual address. On architectures that have extra requirements for canonical virtual addresses
/// (e.g. x86_64 requiring correct sign-extension in high bits), these requirements are always enforced.
///
/// Every address the unwinder and dispatcher handle - image bases, RIP/RSP/RBP snapshot fields, funclet entry
/// points - is a `VAddr`, so that arithmetic on them stays canonicalised and `Debug`/hex-formats consistently.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct VAddr(usize);

impl VAddr {
    /// Construct a new `VAddr`. This will canonicalise the given value.
    pub const fn new(address: usize) -> VAddr {
        VAddr(address).canonicalise()
    }

    pub const fn ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub const fn mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /*
     * How we canonicalise addresses is architecture-specific, but has leaked into `hal` to make the types
     * simpler to use. We enforce whatever requirements are needed for the target architecture.
     */
    cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            /// Canonicalise this virtual address: bits 48..63 must match the sign extension expected from the
            /// value of bit 47.
            pub const fn canonicalise(self) -> VAddr {
                const SIGN_EXTENSION: usize = 0o177777_000_000_000_000_0000;

                VAddr((SIGN_EXTENSION * ((self.0 >> 47) & 0b1)) | (self.0 & ((1 << 48) - 1)))
            }
        } else {
            /// Canonicalise this virtual address. On this architecture, there are no extra requirements, and so we
            /// just return the address as is.
            pub const fn canonicalise(self) -> VAddr {
                self
            }
        }
    }

    /// Align this address to the given alignment, moving downwards if this is not already aligned. `align` must
    /// be `0` or a power-of-two.
    pub fn align_down(self, align: usize) -> VAddr {
        if align.is_power_of_two() {
            VAddr(self.0 & !(align - 1))
        } else {
            assert!(align == 0);
            self
        }
    }

    pub fn is_aligned(self, align: usize) -> bool {
        self.0 % align == 0
    }

    pub fn checked_add(self, rhs: usize) -> Option<Self> {
        Some(VAddr::new(self.0.checked_add(rhs)?))
    }

    pub fn checked_sub(self, rhs: usize) -> Option<Self> {
        Some(VAddr::new(self.0.checked_sub(rhs)?))
    }

    /// Distance from `base` to `self`, if `self >= base`. Used to turn an absolute code address into the
    /// RVA relative to an image or function base.
    pub fn offset_from(self, base: VAddr) -> Option<u64> {
        self.0.checked_sub(base.0).map(|d| d as u64)
    }
}

impl fmt::LowerHex for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VAddr({:#x})", self)
    }
}

impl From<VAddr> for usize {
    fn from(address: VAddr) -> usize {
        address.0
    }
}

impl<T> From<*const T> for VAddr {
    fn from(ptr: *const T) -> VAddr {
        VAddr::new(ptr as usize)
    }
}

impl<T> From<*mut T> for VAddr {
    fn from(ptr: *mut T) -> VAddr {
        VAddr::new(ptr as usize)
    }
}

impl Add<usize> for VAddr {
    type Output = VAddr;

    fn add(self, rhs: usize) -> Self::Output {
        VAddr::new(self.0 + rhs)
    }
}

impl Add<u64> for VAddr {
    type Output = VAddr;

    fn add(self, rhs: u64) -> Self::Output {
        VAddr::new(self.0 + rhs as usize)
    }
}

impl AddAssign<usize> for VAddr {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl Sub<usize> for VAddr {
    type Output = VAddr;

    fn sub(self, rhs: usize) -> Self::Output {
        VAddr::new(self.0 - rhs)
    }
}

impl SubAssign<usize> for VAddr {
    fn sub_assign(&mut self, rhs: usize) {
        *self = *self - rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::VAddr;

    #[test]
    fn offset_from() {
        let base = VAddr::new(0x1000);
        let addr = VAddr::new(0x1234);
        assert_eq!(addr.offset_from(base), Some(0x234));
        assert_eq!(base.offset_from(addr), None);
    }

    #[test]
    fn canonicalises_high_half() {
        let addr = VAddr::new(0xffff_8000_0000_0000);
        assert_eq!(addr.as_u64(), 0xffff_8000_0000_0000);
    }
}
