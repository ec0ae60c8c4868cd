//! Error types for user-data composition.

use std::path::PathBuf;

use thiserror::Error;

use crate::composer::NodeRole;

/// Result type alias for user-data operations.
pub type UserDataResult<T> = std::result::Result<T, UserDataError>;

/// Errors that can occur while rendering user-data.
#[derive(Debug, Error)]
pub enum UserDataError {
    /// A template override file could not be read.
    #[error("failed to read template '{path}': {source}")]
    TemplateRead {
        /// Path of the template file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Compressing a sub-document failed.
    #[error("failed to encode {document}: {source}")]
    Encode {
        /// Name of the document being encoded.
        document: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A `{{TOKEN}}` was left in a rendered document.
    #[error("unresolved placeholder {token} in {document}")]
    UnresolvedPlaceholder {
        /// Name of the document containing the token.
        document: String,
        /// The leftover token, braces included.
        token: String,
    },

    /// The rendered payload is larger than the instance metadata limit.
    #[error("{role} user-data is {size} bytes, exceeding the {limit} byte limit")]
    PayloadTooLarge {
        /// Role whose payload overflowed.
        role: NodeRole,
        /// Rendered size in bytes.
        size: usize,
        /// Maximum accepted size in bytes.
        limit: usize,
    },

    /// A substitution value is not usable.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl UserDataError {
    /// Creates an `UnresolvedPlaceholder` error.
    #[must_use]
    pub fn unresolved(document: impl Into<String>, token: impl Into<String>) -> Self {
        Self::UnresolvedPlaceholder {
            document: document.into(),
            token: token.into(),
        }
    }

    /// Creates an `InvalidValue` error.
    #[must_use]
    pub fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }

    /// Returns true if the error is a size ceiling violation.
    #[must_use]
    pub fn is_too_large(&self) -> bool {
        matches!(self, Self::PayloadTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_display_names_document_and_token() {
        let err = UserDataError::unresolved("kubeadm-join.yaml", "{{KUBEADM_TOKEN}}");
        assert_eq!(
            err.to_string(),
            "unresolved placeholder {{KUBEADM_TOKEN}} in kubeadm-join.yaml"
        );
    }

    #[test]
    fn too_large_display() {
        let err = UserDataError::PayloadTooLarge {
            role: NodeRole::Worker,
            size: 20_000,
            limit: 16_384,
        };
        assert!(err.is_too_large());
        assert_eq!(
            err.to_string(),
            "worker user-data is 20000 bytes, exceeding the 16384 byte limit"
        );
    }

    #[test]
    fn template_read_keeps_source() {
        let err = UserDataError::TemplateRead {
            path: PathBuf::from("/nope/user-data.yaml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_too_large());
    }
}
