//! Leverage common functionality across sluice crates.
//!
//! - [future]: deliver the outcome of an asynchronous operation, either to a
//!   callback or to an awaitable (and blockable) completion.
//! - [env]: read typed configuration values from environment variables.

pub mod env;
pub mod future;

/// A macro to create a `NonZeroUsize` from a value, panicking if the value is zero.
///
/// When used in a `const` context the check happens at compile time.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        match ::core::num::NonZeroUsize::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}
