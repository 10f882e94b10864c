//! Address types of the guest and the host.

/// Guest virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Gva(u64);

impl Gva {
    /// Create a new guest virtual address.
    #[inline(always)]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Gpa(u64);

impl Gpa {
    /// Create a new guest physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

/// Host virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Hva(usize);

impl Hva {
    /// Create a new host virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Host virtual address of `ptr`.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into a raw pointer.
    #[inline]
    pub const fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

macro_rules! impl_arith {
    ($t: ty, $i: ty) => {
        impl core::ops::Add<$i> for $t {
            type Output = Self;

            fn add(self, other: $i) -> Self::Output {
                Self(self.0.wrapping_add(other))
            }
        }
        impl core::ops::AddAssign<$i> for $t {
            fn add_assign(&mut self, other: $i) {
                self.0 = self.0.wrapping_add(other)
            }
        }
        impl core::ops::Sub<$i> for $t {
            type Output = Self;

            fn sub(self, other: $i) -> Self::Output {
                Self(self.0.wrapping_sub(other))
            }
        }
        impl core::ops::BitAnd<$i> for $t {
            type Output = Self;

            fn bitand(self, other: $i) -> Self {
                Self(self.0 & other)
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
    };
}

impl_arith!(Gva, u64);
impl_arith!(Gpa, u64);
impl_arith!(Hva, usize);
