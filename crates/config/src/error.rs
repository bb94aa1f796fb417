// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use std::path::PathBuf;

/// Errors that can occur while reading or validating the configuration files.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A configuration file could not be read.
    #[error("Failed to read config file `{path}`: {details}")]
    FileRead {
        /// The file that could not be read.
        path: PathBuf,
        /// A description of the IO failure.
        details: String,
    },

    /// A configuration file could not be deserialized.
    #[error("YAML deserialization error in `{path}`: {details}")]
    Deserialization {
        /// The file that failed to parse.
        path: PathBuf,
        /// A description of the parse failure.
        details: String,
    },

    /// A mandatory configuration file is missing. Startup aborts on this.
    #[error("Mandatory config file `{path}` is missing")]
    MissingMandatory {
        /// The missing file.
        path: PathBuf,
    },

    /// A resource entry in the vendor overlay failed validation. The common
    /// layer skips malformed entries with a warning instead.
    #[error("Invalid resource entry `{name}`: {details}")]
    InvalidResource {
        /// The `name` field of the offending entry.
        name: String,
        /// Why the entry was rejected.
        details: String,
    },

    /// A property value could not be interpreted with the requested type.
    #[error("Property `{key}` has non-{expected} value `{value}`")]
    InvalidProperty {
        /// The property key.
        key: String,
        /// The expected scalar type.
        expected: &'static str,
        /// The raw string value.
        value: String,
    },

    /// The target config declares an inconsistent topology override.
    #[error("Invalid target config: {details}")]
    InvalidTarget {
        /// Why the target config was rejected.
        details: String,
    },
}

impl Error {
    pub(crate) fn file_read(path: &std::path::Path, err: &std::io::Error) -> Self {
        Error::FileRead {
            path: path.to_path_buf(),
            details: err.to_string(),
        }
    }

    pub(crate) fn yaml(path: &std::path::Path, err: &serde_yaml::Error) -> Self {
        Error::Deserialization {
            path: path.to_path_buf(),
            details: err.to_string(),
        }
    }
}
