// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use miette::Diagnostic;

/// Errors that can occur while loading or validating scheduler configuration.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// A collection of errors found while validating the configuration.
    #[error("Invalid configuration: {errors:?}")]
    InvalidConfiguration {
        /// Every validation failure found, with its config path.
        errors: Vec<String>,
    },

    /// A configuration file could not be read.
    #[error("File read error for `{path}`: {details}")]
    FileReadError {
        /// Path of the file.
        path: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A configuration file could not be deserialized.
    #[error("{format} deserialization error for `{path}`: {details}")]
    DeserializationError {
        /// Path of the file.
        path: String,
        /// The format of the configuration file (e.g. "JSON").
        format: &'static str,
        /// A description of the error that occurred.
        details: String,
    },

    /// The configuration file extension is not recognized.
    #[error("Unsupported config format for `{path}` (expected .json, .yaml, or .yml)")]
    UnsupportedFormat {
        /// Path of the file.
        path: String,
    },
}
