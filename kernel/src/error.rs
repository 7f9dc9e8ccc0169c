//! Kernel error types
//!
//! Every recoverable failure in the kernel is one of the variants below.
//! Syscalls translate them into stable negative return values; everything
//! else propagates them with `?` until a caller can either recover or
//! declare the machine state unrecoverable.

use core::fmt;

/// Kernel-wide error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The PMM (or an intermediate page table) could not be allocated
    OutOfMemory,
    /// Misaligned address, zero-length count, bad endpoint id, or a user
    /// pointer in the kernel range
    InvalidArguments,
    /// IPC target does not exist
    NotFound,
    /// `map` called on a page that is already mapped with different flags
    AlreadyMapped,
    /// Unrecoverable; terminates the offending task
    Fault,
}

impl KernelError {
    /// Stable mapping to the negative values returned across the syscall
    /// boundary. These values are ABI; do not renumber.
    pub const fn code(self) -> isize {
        match self {
            KernelError::NotFound => -1,
            KernelError::OutOfMemory => -2,
            KernelError::InvalidArguments => -3,
            KernelError::AlreadyMapped => -4,
            KernelError::Fault => -5,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::InvalidArguments => write!(f, "invalid arguments"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::AlreadyMapped => write!(f, "already mapped with different flags"),
            KernelError::Fault => write!(f, "unrecoverable fault"),
        }
    }
}

/// Kernel result alias used throughout the crate
pub type Result<T> = core::result::Result<T, KernelError>;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_negative_and_distinct() {
        let codes = [
            KernelError::NotFound.code(),
            KernelError::OutOfMemory.code(),
            KernelError::InvalidArguments.code(),
            KernelError::AlreadyMapped.code(),
            KernelError::Fault.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(*a < 0);
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
