// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Error type for this crate.
#[derive(Debug, Error)]
pub enum SrpmPackagingError {
    #[error("no compatible architectures found for build")]
    NoCompatibleArch,

    #[error("{tool} failed: {message}")]
    Tool {
        tool: &'static str,
        message: String,
    },

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("malformed signature file {0}: {1:?}")]
    SignatureFileFormat(String, serde_json::Error),

    #[error("no signature for file ({0}) found")]
    SignatureMissing(String),

    #[error("file ({path}) has mismatching signature: expected ({expected}) - actual ({actual})")]
    SignatureMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("unable to hydrate files: {}", .0.join(", "))]
    Hydration(Vec<String>),

    #[error("URL parse error: {0:?}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP error: {0:?}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, SrpmPackagingError>;
