//! Error types for qtl2-rs
//!
//! Library functions return `anyhow::Result`. Errors that callers may want to
//! tell apart (bad options, inconsistent data, unparseable input) are raised
//! as `QtlError` values and can be recovered with `downcast_ref::<QtlError>()`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QtlError {
    /// Invalid option values, rejected before any computation starts
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Inputs that violate a data invariant (unknown markers, tied positions,
    /// no overlapping individuals)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Unparseable input file contents
    #[error("Parse error in {file} at line {line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QtlError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn parse(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    /// True if `err` is a configuration error.
    pub fn is_config(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<QtlError>(), Some(QtlError::Config { .. }))
    }

    /// True if `err` is an invalid-data error.
    pub fn is_invalid_data(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<QtlError>(),
            Some(QtlError::InvalidData { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_config() {
        let err: anyhow::Error = QtlError::config("n_perm must be positive").into();
        assert!(QtlError::is_config(&err));
        assert!(!QtlError::is_invalid_data(&err));
        assert_eq!(
            err.to_string(),
            "Configuration error: n_perm must be positive"
        );
    }

    #[test]
    fn test_parse_message() {
        let err = QtlError::parse("geno.csv", 12, "expected 6 fields");
        assert_eq!(
            err.to_string(),
            "Parse error in geno.csv at line 12: expected 6 fields"
        );
    }
}
