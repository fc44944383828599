//! Kernel result types: typed errors for the Rust API surface plus the packed
//! wire result codes placed in guest-visible IPC responses.

use thiserror::Error;

/// Packed result code in the guest ABI layout: module in bits 0..9,
/// description in bits 9..22. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResultCode(pub u32);

impl ResultCode {
    /// The success code, all bits clear.
    pub const SUCCESS: ResultCode = ResultCode(0);

    /// Pack a module/description pair.
    pub const fn new(module: u32, description: u32) -> Self {
        ResultCode(module | (description << 9))
    }

    /// Module field of the code.
    pub const fn module(self) -> u32 {
        self.0 & 0x1FF
    }

    /// Description field of the code.
    pub const fn description(self) -> u32 {
        (self.0 >> 9) & 0x1FFF
    }

    /// Whether this code denotes success.
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Whether this code denotes an error.
    pub const fn is_error(self) -> bool {
        self.0 != 0
    }
}

impl core::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x} ({}-{})", self.0, self.module(), self.description())
    }
}

/// Module number for kernel results in the guest ABI.
pub const MODULE_KERNEL: u32 = 1;
/// Module number for service-directory results in the guest ABI.
pub const MODULE_SM: u32 = 21;

/// Errors surfaced by kernel objects and primitives. Every variant that is
/// part of the guest-visible ABI has a fixed wire code; see
/// [`KernelError::to_result_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// The maximum session count of a port was reached.
    #[error("out of sessions")]
    OutOfSessions,
    /// A guest virtual address or range was not readable/writable.
    #[error("invalid address")]
    InvalidAddress,
    /// A resource-limit category is exhausted.
    #[error("resource limit reached")]
    LimitReached,
    /// The handle table has no free slot.
    #[error("out of handles")]
    OutOfHandles,
    /// A handle did not resolve to an object of the expected type.
    #[error("invalid handle")]
    InvalidHandle,
    /// A wait or reservation timed out.
    #[error("timed out")]
    TimedOut,
    /// A wait was cancelled by the waiting thread.
    #[error("cancelled")]
    Cancelled,
    /// The peer endpoint of a session has been closed.
    #[error("session closed")]
    SessionClosed,
    /// The server endpoint of a port has been closed.
    #[error("port closed")]
    PortClosed,
    /// A named object lookup failed.
    #[error("not found")]
    NotFound,
    /// An object name was empty, too long, or not printable ASCII.
    #[error("invalid name")]
    InvalidName,
    /// An operation was attempted in a state that does not permit it.
    #[error("invalid state")]
    InvalidState,
}

impl KernelError {
    /// The packed code this error carries on the wire.
    pub const fn to_result_code(self) -> ResultCode {
        let description = match self {
            KernelError::OutOfSessions => 7,
            KernelError::InvalidAddress => 102,
            KernelError::LimitReached => 132,
            KernelError::OutOfHandles => 105,
            KernelError::InvalidHandle => 114,
            KernelError::TimedOut => 117,
            KernelError::Cancelled => 118,
            KernelError::SessionClosed => 123,
            KernelError::PortClosed => 131,
            KernelError::NotFound => 121,
            KernelError::InvalidName => 120,
            KernelError::InvalidState => 125,
        };
        ResultCode::new(MODULE_KERNEL, description)
    }
}

impl From<KernelError> for ResultCode {
    fn from(err: KernelError) -> ResultCode {
        err.to_result_code()
    }
}

/// Shorthand used throughout the kernel crate.
pub type KResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_module_and_description() {
        let code = ResultCode::new(MODULE_KERNEL, 123);
        assert_eq!(code.module(), MODULE_KERNEL);
        assert_eq!(code.description(), 123);
        assert!(code.is_error());
        assert!(ResultCode::SUCCESS.is_success());
    }

    #[test]
    fn kernel_errors_use_fixed_wire_codes() {
        assert_eq!(
            KernelError::SessionClosed.to_result_code(),
            ResultCode::new(1, 123)
        );
        assert_eq!(
            KernelError::LimitReached.to_result_code(),
            ResultCode::new(1, 132)
        );
        assert_eq!(
            KernelError::TimedOut.to_result_code(),
            ResultCode::new(1, 117)
        );
    }
}
