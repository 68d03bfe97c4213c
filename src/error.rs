// src/error.rs

//! Error kinds surfaced by the orchestration layer.
//!
//! Every variant carries the operation that failed and the entity it was
//! acting on, plus the collaborator's own message, so a caller can act on
//! the error without re-deriving what the agent was doing.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the agent's engines.
#[derive(Debug, Error)]
pub enum Error {
    // =========================================================================
    // Image Cache
    // =========================================================================
    /// Template download failed.
    #[error("{operation} '{entity}' failed: transport error: {message}")]
    Transport {
        operation: String,
        entity: String,
        message: String,
    },

    /// Downloaded or cached content does not match its expected checksum.
    #[error("{operation} '{entity}' failed: checksum mismatch (expected {expected}, got {actual})")]
    Integrity {
        operation: String,
        entity: String,
        expected: String,
        actual: String,
    },

    // =========================================================================
    // Provisioning
    // =========================================================================
    /// Image format conversion failed.
    #[error("{operation} '{entity}' failed: conversion error: {message}")]
    Conversion {
        operation: String,
        entity: String,
        message: String,
    },

    /// A guest disk toolkit step failed.
    #[error("{operation} '{entity}' failed: customization error: {message}")]
    Customization {
        operation: String,
        entity: String,
        message: String,
    },

    /// The guest OS family could not be recognised.
    #[error("{operation} '{entity}' failed: unsupported guest OS '{distro}'")]
    UnsupportedGuest {
        operation: String,
        entity: String,
        distro: String,
    },

    // =========================================================================
    // Hypervisor
    // =========================================================================
    /// A domain, pool, volume or network call failed.
    #[error("{operation} '{entity}' failed: hypervisor error: {message}")]
    Hypervisor {
        operation: String,
        entity: String,
        message: String,
    },

    /// A named snapshot or backup was not found in any candidate pool.
    #[error("{operation} '{entity}' failed: not found: {message}")]
    NotFound {
        operation: String,
        entity: String,
        message: String,
    },

    /// The virtance is not in a state that permits the operation.
    #[error("{operation} '{entity}' rejected: virtance is {state}, expected {expected}")]
    Precondition {
        operation: String,
        entity: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Network Policy
    // =========================================================================
    /// The host-wide firewall lock was not obtained in time.
    #[error("{operation} '{entity}' failed: firewall lock not released within {timeout:?}")]
    LockTimeout {
        operation: String,
        entity: String,
        timeout: Duration,
    },

    /// A firewall rule could not be compiled.
    #[error("invalid {direction} rule for '{entity}': {reason}")]
    InvalidRule {
        entity: String,
        direction: String,
        reason: String,
    },

    /// A packet-filter call failed.
    #[error("{operation} '{entity}' failed: packet filter error: {message}")]
    PacketFilter {
        operation: String,
        entity: String,
        message: String,
    },

    /// An interface address call failed.
    #[error("{operation} '{entity}' failed: interface error: {message}")]
    Interface {
        operation: String,
        entity: String,
        message: String,
    },

    // =========================================================================
    // Local
    // =========================================================================
    /// Local filesystem error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    /// Returns true for errors caused by the request rather than the host.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::Precondition { .. }
                | Error::NotFound { .. }
                | Error::InvalidRule { .. }
                | Error::UnsupportedGuest { .. }
        )
    }

    /// Returns true when retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::Transport { .. })
    }

    /// Name of the operation that failed, if the error carries one.
    pub fn operation(&self) -> Option<&str> {
        match self {
            Error::Transport { operation, .. }
            | Error::Integrity { operation, .. }
            | Error::Conversion { operation, .. }
            | Error::Customization { operation, .. }
            | Error::UnsupportedGuest { operation, .. }
            | Error::Hypervisor { operation, .. }
            | Error::NotFound { operation, .. }
            | Error::Precondition { operation, .. }
            | Error::LockTimeout { operation, .. }
            | Error::PacketFilter { operation, .. }
            | Error::Interface { operation, .. } => Some(operation),
            Error::InvalidRule { .. } | Error::Io { .. } | Error::Config(_) => None,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
