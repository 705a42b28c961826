// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the log shipping pipeline.

use reqwest::StatusCode;

/// Errors surfaced to the code that starts or writes into a logging session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid destination URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("context cancelled")]
    Cancelled,

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("No tokio runtime available to spawn background tasks")]
    NoRuntime,
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Cancelled => std::io::ErrorKind::BrokenPipe,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Terminal outcome of a batch that could not be delivered.
///
/// Nothing above the transport propagates these to the log-writing caller;
/// they are logged and the batch is discarded.
#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    /// The batch could not be encoded. Retrying would not help.
    #[error("Failed to prepare payload: {0}")]
    Payload(String),

    /// The endpoint refused the batch with a client error.
    #[error("Request rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    /// Every attempt failed with a retryable condition.
    #[error("Failed after {attempts} attempts (last status: {last_status:?})")]
    Exhausted {
        attempts: u32,
        last_status: Option<StatusCode>,
        body: Option<String>,
    },
}
