//! The error taxonomy shared across the crate.

/// Fatal and pre-flight error conditions of the SVM core.
///
/// `Unavailable` and `Disabled` are surfaced before any guest runs and mean
/// virtualization must not be attempted on this processor. The remaining
/// variants are fatal to the virtual core that raised them and leave sibling
/// cores untouched.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SvmError {
    #[error("the processor does not support SVM")]
    Unavailable,

    #[error("SVM is disabled by the BIOS (locked: {locked})")]
    Disabled {
        /// `true` when the BIOS locked the disable bit and SVM cannot be
        /// enabled at all, `false` when it is unlockable with a key.
        locked: bool,
    },

    #[error("page allocation failed")]
    OutOfMemory,

    #[error("guest fault at {addr:#x} outside any shadow region")]
    UnmappedFault { addr: u64 },

    #[error("unhandled #VMEXIT {code:#x}")]
    UnhandledExit { code: u64 },
}
