// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for IMP runtime operations.
//!
//! This module defines the error type returned by every fallible runtime call,
//! covering addressing mistakes, missing modules or edges, resource exhaustion
//! and failures reported by stage callbacks or the kernel.

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur when using the IMP runtime.
///
/// Every operation reports failure to its immediate caller through this enum.
/// No variant is fatal to the process: a failed bind or pool creation leaves
/// previously established state untouched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device-kind, group, channel or pool index is outside the fixed
    /// address space.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A bind names an output port the source module does not have.
    #[error("Invalid output {output} (module has {count} output(s))")]
    InvalidOutput {
        /// Requested output index.
        output: usize,
        /// Number of outputs the source module exposes.
        count: usize,
    },

    /// A module, channel, pool or binding edge could not be resolved.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The target slot is already occupied, or the object is already
    /// associated elsewhere.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Host or physical memory could not be obtained.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// The pixel format has no sizing rule.
    #[error("Unsupported pixel format 0x{0:08x}")]
    UnsupportedFormat(u32),

    /// A stage-supplied callback returned failure.
    #[error("Handler failure in {hook}: {reason}")]
    HandlerFailure {
        /// Name of the hook that failed (`init`, `process`, `bind`, ...).
        hook: &'static str,
        /// Failure description reported by the hook.
        reason: String,
    },

    /// A blocking operation timed out before completing.
    #[error("Timeout")]
    Timeout,

    /// The underlying kernel call or device node failed.
    #[error("Device error: {0}")]
    Device(#[from] std::io::Error),

    /// A configuration document could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// An argument passed to a runtime function was invalid.
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// A generic error for failures not covered by the variants above.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Converts a kernel-style status code to a Rust [`Result`].
    ///
    /// Device backends that wrap raw driver calls receive `0` on success and
    /// `-errno` on failure; this helper turns the latter into
    /// [`Error::Device`] carrying the matching OS error.
    ///
    /// # Examples
    ///
    /// ```
    /// use imp::Error;
    ///
    /// assert!(Error::from_status(0).is_ok());
    /// assert!(matches!(Error::from_status(-19), Err(Error::Device(_))));
    /// ```
    pub fn from_status(status: i32) -> Result<()> {
        match status {
            0.. => Ok(()),
            errno => Err(Error::Device(std::io::Error::from_raw_os_error(
                errno.saturating_neg(),
            ))),
        }
    }

    /// Wraps a callback failure so callers can see which hook failed.
    pub(crate) fn handler(hook: &'static str, source: impl std::fmt::Display) -> Self {
        Error::HandlerFailure {
            hook,
            reason: source.to_string(),
        }
    }

    /// Returns `true` for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
