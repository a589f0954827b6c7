//! Crate-wide error handling.
//!
//! All domain errors are consolidated into a single [`Error`] enum with a
//! [`Kind`] drawn from the seven failure categories the tool distinguishes:
//! load, compile, substitution, transport, contract, hook, and runtime.
//! External library errors keep dedicated `#[from]` variants so `?` works
//! at the edges without manual mapping.

use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} error: {message}")]
    Fault {
        kind: Kind,
        message: Cow<'static, str>,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Failure categories for consolidated errors.
///
/// Load and compile errors accumulate and are reported at phase end; the
/// remaining kinds surface from a running context and fail its subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Bad manifest, undefined or cyclic variable definition, missing field.
    Load,
    /// Unknown peer reference, unsatisfiable dependency, invalid lifecycle link.
    Compile,
    /// Variable missing at substitution time, or substitution fails to converge.
    Substitution,
    /// HTTP dispatch failed or timed out.
    Transport,
    /// Unexpected status, content type, JSON parse, or schema validation failure.
    Contract,
    /// User hook code failed.
    Hook,
    /// Action on a missing field, empty `[]` extraction, and similar logic faults.
    Runtime,
}

impl Kind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Compile => "compile",
            Self::Substitution => "substitution",
            Self::Transport => "transport",
            Self::Contract => "contract",
            Self::Hook => "hook",
            Self::Runtime => "runtime",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Error {
    #[must_use]
    pub fn fault(kind: Kind, message: impl Into<Cow<'static, str>>) -> Self {
        Self::Fault {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn load(message: impl Into<Cow<'static, str>>) -> Self {
        Self::fault(Kind::Load, message)
    }

    #[must_use]
    pub fn compile(message: impl Into<Cow<'static, str>>) -> Self {
        Self::fault(Kind::Compile, message)
    }

    #[must_use]
    pub fn substitution(message: impl Into<Cow<'static, str>>) -> Self {
        Self::fault(Kind::Substitution, message)
    }

    #[must_use]
    pub fn transport(message: impl Into<Cow<'static, str>>) -> Self {
        Self::fault(Kind::Transport, message)
    }

    #[must_use]
    pub fn contract(message: impl Into<Cow<'static, str>>) -> Self {
        Self::fault(Kind::Contract, message)
    }

    #[must_use]
    pub fn hook(message: impl Into<Cow<'static, str>>) -> Self {
        Self::fault(Kind::Hook, message)
    }

    #[must_use]
    pub fn runtime(message: impl Into<Cow<'static, str>>) -> Self {
        Self::fault(Kind::Runtime, message)
    }

    /// The consolidated kind, if this is a domain fault.
    #[must_use]
    pub const fn kind(&self) -> Option<Kind> {
        match self {
            Self::Fault { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_kind(&self, kind: Kind) -> bool {
        self.kind() == Some(kind)
    }
}
