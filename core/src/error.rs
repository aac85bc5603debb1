//! Structured error types for the hivemind kernel
//!
//! Every fault that would otherwise stop the kernel loop is demoted to an
//! event or a returned outcome; the variants here are what callers and the
//! trigger pipeline actually see.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Primary error type for kernel operations
#[derive(Error, Debug)]
pub enum KernelError {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Malformed subscription pattern or contract definition
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Envelope is missing a required field
    #[error("invalid envelope: missing {field}")]
    MissingEnvelopeField { field: String },

    /// Trigger filename does not resolve to any known role
    #[error("unknown trigger target: {name}")]
    UnknownTarget { name: String },

    // =========================================================================
    // Trigger Ingest Errors
    // =========================================================================
    /// Another ingest run holds the claim on this trigger file
    #[error("trigger already being processed: {path}")]
    ClaimConflict { path: PathBuf },

    /// Claim rename failed
    #[error("trigger claim rename failed: {path}")]
    RenameError { path: PathBuf, source: std::io::Error },

    /// Trigger file could not be read
    #[error("trigger read failed: {path}")]
    ReadError { path: PathBuf, source: std::io::Error },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// State file could not be parsed
    #[error("state file corrupted: {path}")]
    StoreCorrupted { path: PathBuf },

    /// Atomic write of a state file failed
    #[error("state file write failed: {path}")]
    PersistFailed { path: PathBuf, source: std::io::Error },

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelError {
    /// Check if error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        match self {
            // Claim conflicts resolve once the holder finishes or goes stale
            Self::ClaimConflict { .. } => true,
            Self::RenameError { .. } => true,
            Self::ReadError { .. } => true,
            Self::PersistFailed { .. } => true,

            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            Self::Validation { .. }
            | Self::MissingEnvelopeField { .. }
            | Self::UnknownTarget { .. }
            | Self::StoreCorrupted { .. }
            | Self::Json(_) => false,
        }
    }
}

/// Result type alias using KernelError
pub type Result<T> = std::result::Result<T, KernelError>;

/// User-visible outcome of a send operation
///
/// Terminal rejections surface immediately from the trigger pipeline;
/// delivery results arrive later when the tracker resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    NoTargets,
    DeliveryFailed,
    DeliveredVerified,
    AcceptedUnverified,
    RoutedUnverifiedTimeout,
    BroadcastUnverifiedTimeout,
    DuplicateMessageId,
    WorkflowGate,
    InvalidMessage,
    WindowUnavailable,
}

impl SendOutcome {
    /// Outcomes that mean the message reached every expected recipient
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::DeliveredVerified)
    }

    /// Outcomes reported before any delivery was attempted
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NoTargets
                | Self::DuplicateMessageId
                | Self::WorkflowGate
                | Self::InvalidMessage
                | Self::WindowUnavailable
        )
    }
}

impl std::fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::NoTargets => "no_targets",
            Self::DeliveryFailed => "delivery_failed",
            Self::DeliveredVerified => "delivered.verified",
            Self::AcceptedUnverified => "accepted.unverified",
            Self::RoutedUnverifiedTimeout => "routed_unverified_timeout",
            Self::BroadcastUnverifiedTimeout => "broadcast_unverified_timeout",
            Self::DuplicateMessageId => "duplicate_message_id",
            Self::WorkflowGate => "workflow_gate",
            Self::InvalidMessage => "invalid_message",
            Self::WindowUnavailable => "window_unavailable",
        };
        write!(f, "{}", label)
    }
}
