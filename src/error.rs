//! Error type shared by the allocation and fault paths.
//!
//! Only resource exhaustion and bad fault codes are reported as values;
//! violating a structural invariant is a kernel bug and panics at the point
//! of detection.

use core::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmError {
    /// No free frame and no evictable frame (or in interrupt context with
    /// none free).
    OutOfMemory,
    /// No swap slot, or a reservation cannot be satisfied.
    OutOfSpace,
    /// Unrecognized fault type.
    InvalidArg,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::OutOfMemory => "out of physical memory",
            VmError::OutOfSpace => "out of swap space",
            VmError::InvalidArg => "invalid argument",
        };
        f.write_str(msg)
    }
}
