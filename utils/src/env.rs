//! Read typed configuration from environment variables.

use std::{env, fmt::Display, str::FromStr};
use thiserror::Error;

/// Errors that can occur when reading a variable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{name} is not valid unicode")]
    NotUnicode { name: String },
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

/// Read and parse the environment variable `name`.
///
/// Returns `Ok(None)` if the variable is not set. Surrounding whitespace is
/// ignored.
pub fn var<T>(name: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => parse(name, &value).map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(Error::NotUnicode {
            name: name.to_string(),
        }),
    }
}

/// Parse `value` as the content of the variable `name`.
pub fn parse<T>(name: &str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|err: T::Err| Error::Invalid {
        name: name.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}
