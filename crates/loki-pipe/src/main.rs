// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Tees stdin to stdout and ships every line to Loki.
//!
//! ```text
//! my-service 2>&1 | LOKI_URL=http://localhost:3100/loki/api/v1/push loki-pipe
//! ```
//!
//! Runs until stdin reaches EOF or the process receives Ctrl-C, then flushes
//! whatever is still buffered before exiting.

use loki_logger::{Config, LokiLogger};
use std::env;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOKI_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let logger = match LokiLogger::start(config, cancel.clone()) {
        Ok(logger) => logger,
        Err(e) => {
            error!("Failed to start Loki session: {e}");
            return ExitCode::FAILURE;
        }
    };
    let sink = logger.sink();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, flushing remaining lines");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if sink.write_line(line.as_bytes()).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {e}");
                    break;
                }
            }
        }
    }

    logger.shutdown().await;
    if sink.dropped_batches() > 0 {
        info!("{} batches were dropped while the delivery queue was full", sink.dropped_batches());
    }
    ExitCode::SUCCESS
}
