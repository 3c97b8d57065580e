//! Error types shared across the herder.
//!
//! Each subsystem has its own error enum; the HTTP layer maps them onto
//! status codes in `server::ApiError`.

use thiserror::Error;

/// Errors from the container facade.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container engine refused or failed an operation.
    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    /// A predicate resolved to no container where one was required.
    #[error("no matching container found")]
    NotFound,

    /// A predicate matched more than or fewer than exactly one container.
    #[error("expected exactly 1 matching container, got {0}")]
    NotUnique(usize),

    /// A lambda exceeded its deadline.
    #[error("container {container} exceeded its deadline")]
    Timeout { container: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the credit ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A debit was refused because the balance is already exhausted.
    #[error("no credits left for {subject}")]
    NoCredits { subject: String },

    #[error("ledger store error: {0}")]
    Store(#[from] redb::Error),
}

impl From<redb::DatabaseError> for LedgerError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Store(e.into())
    }
}

impl From<redb::TransactionError> for LedgerError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Store(e.into())
    }
}

impl From<redb::TableError> for LedgerError {
    fn from(e: redb::TableError) -> Self {
        Self::Store(e.into())
    }
}

impl From<redb::StorageError> for LedgerError {
    fn from(e: redb::StorageError) -> Self {
        Self::Store(e.into())
    }
}

impl From<redb::CommitError> for LedgerError {
    fn from(e: redb::CommitError) -> Self {
        Self::Store(e.into())
    }
}

/// Errors from token generation and validation.
#[derive(Debug, Error)]
pub enum TokenError {
    /// A PEM key file could not be read or parsed.
    #[error("could not load {path}: {reason}")]
    Key { path: String, reason: String },

    /// The token failed signature or claim validation.
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    /// The token verified but a required claim is missing or malformed.
    #[error("missing or malformed claim: {0}")]
    BadClaim(&'static str),

    /// No bearer token was supplied at all.
    #[error("no token supplied")]
    Missing,
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {key}")]
    MissingKey { key: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
