// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Loki Logger
//!
//! A batching log sink that ships process output to a Grafana Loki push
//! endpoint.
//!
//! ## Overview
//!
//! Lines written to a [`LokiSink`] are buffered and handed to delivery when
//! either the batch size is reached or the flush timer fires. Each batch is
//! grouped into one stream per severity level, serialized to the push API
//! JSON format, optionally gzipped and POSTed with retries.
//!
//! ```text
//!   writer ──> LokiSink ──(size)──┐
//!                 │               v
//!                 └──(timer)──> queue ──> DeliveryWorker ──> Transport ──> Loki
//! ```
//!
//! Cancelling the session token stops new writes and sends whatever is still
//! buffered as a final batch.
//!
//! ## Modules
//!
//! - [`config`]: session configuration and environment loading
//! - [`sink`]: the write side, also usable as a `tracing_subscriber` writer
//! - [`formatter`]: line parsing and stream grouping
//! - [`transport`]: HTTP delivery with compression and retries
//! - [`logger`]: session lifecycle

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]

pub mod config;
pub mod credential;
pub mod error;
pub mod formatter;
pub mod logger;
pub mod sink;
pub mod transport;

mod scheduler;
mod worker;

pub use config::{Config, FlushPolicy};
pub use credential::CredentialProvider;
pub use error::{Error, ShippingError};
pub use formatter::{Batch, BatchFormatter, Level};
pub use logger::{LokiLogger, SessionOptions};
pub use sink::{EchoWriter, LokiSink};
pub use transport::Transport;
