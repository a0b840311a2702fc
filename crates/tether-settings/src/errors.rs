//! Settings errors.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but reading it failed.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The settings file is not JSON, or a field has the wrong type.
    #[error("malformed settings in {}: {source}", path.display())]
    Malformed {
        /// Offending file.
        path: PathBuf,
        /// Decoder failure.
        source: serde_json::Error,
    },
    /// Compiled defaults failed to round-trip through JSON.
    #[error("settings encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    /// A field holds a value the bridge cannot run with.
    #[error("{field}: {reason}")]
    Invalid {
        /// Wire name of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    /// Shorthand for [`SettingsError::Invalid`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_file() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/tether.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "cannot read /etc/tether.json: denied");

        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = SettingsError::Malformed {
            path: PathBuf::from("s.json"),
            source,
        };
        assert!(err.to_string().starts_with("malformed settings in s.json"));
    }

    #[test]
    fn invalid_names_the_field() {
        let err = SettingsError::invalid("tickInterval", "must be positive");
        assert_eq!(err.to_string(), "tickInterval: must be positive");
        assert!(std::error::Error::source(&err).is_none());
    }
}
