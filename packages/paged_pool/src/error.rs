use thiserror::Error;

/// Errors that can occur when configuring a [`Pool`][crate::Pool].
///
/// Only configuration problems are reported as errors. Running out of objects is reported by
/// [`Pool::get()`][crate::Pool::get] returning `None`, and misuse of the pool (returning a
/// foreign object, returning an object twice) is a fatal condition that panics.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool was configured with an object size of zero bytes.
    #[error("pool objects must have a non-zero size")]
    ZeroSizedObject,

    /// The requested object size and alignment do not form a valid memory layout, or the
    /// alignment cannot be satisfied by the backing page store.
    #[error("invalid object layout (size {size}, align {align}): {problem}")]
    InvalidLayout {
        /// The requested object size in bytes.
        size: usize,

        /// The requested object alignment in bytes.
        align: usize,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// The object is so large that a backing block for it cannot be described.
    #[error("object size {size} cannot be backed by pages of {page_size} bytes")]
    ObjectTooLarge {
        /// The requested object size in bytes.
        size: usize,

        /// The page size of the backing page store.
        page_size: usize,
    },
}

/// A specialized `Result` type for pool configuration, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
