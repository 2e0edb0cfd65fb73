//! Command errors.

use latchkey_client::{KeyError, ResolverError};
use latchkey_core::StoreError;
use thiserror::Error;

/// Errors that stop a maintenance command.
#[derive(Error, Debug)]
pub enum CliError {
    /// Opening or reading the record store failed.
    ///
    /// Usually a wrong `--db` path or a database still held by a running
    /// client.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Contact index could not be loaded or swept
    #[error("contact error: {0}")]
    Contacts(#[from] ResolverError),

    /// Signed prekey pruning failed
    #[error("key error: {0}")]
    Keys(#[from] KeyError),
}
