// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session lifecycle: wires the sink, the flush scheduler and the delivery
//! worker together and tears them down in order.

use crate::config::Config;
use crate::credential::CredentialProvider;
use crate::error::Error;
use crate::formatter::BatchFormatter;
use crate::scheduler::FlushScheduler;
use crate::sink::{EchoWriter, LokiSink, Shared};
use crate::transport::Transport;
use crate::worker::DeliveryWorker;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Optional collaborators for a session.
pub struct SessionOptions {
    /// Receives a copy of every accepted line. Defaults to stdout.
    pub echo: Option<EchoWriter>,
    /// Overrides the token from [`Config::access_token`].
    pub credentials: Option<CredentialProvider>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            echo: Some(Box::new(std::io::stdout())),
            credentials: None,
        }
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("echo", &self.echo.is_some())
            .field("credentials", &self.credentials)
            .finish()
    }
}

/// A running logging session.
///
/// Cancelling the token passed to [`LokiLogger::start`] (or calling
/// [`LokiLogger::shutdown`]) stops accepting writes and queues whatever is
/// still buffered as one final batch.
#[derive(Debug)]
pub struct LokiLogger {
    sink: LokiSink,
    cancel: CancellationToken,
    scheduler: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl LokiLogger {
    /// Starts a session that echoes to stdout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config, cancel: CancellationToken) -> Result<Self, Error> {
        Self::start_with(config, cancel, SessionOptions::default())
    }

    pub fn start_with(
        config: Config,
        cancel: CancellationToken,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let credentials = options
            .credentials
            .unwrap_or_else(|| CredentialProvider::from_option(config.access_token.as_deref()));
        let config = Arc::new(config);
        let transport = Arc::new(Transport::new(Arc::clone(&config), credentials)?);

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(Shared::new(config.batch_size, tx, cancel.clone()));

        let scheduler = FlushScheduler::new(
            Arc::clone(&shared),
            config.flush_interval,
            config.flush_policy,
            cancel.clone(),
        );
        let worker = DeliveryWorker::new(rx, BatchFormatter::new(&config.service_name), transport);

        let scheduler = runtime.spawn(scheduler.run());
        let worker = runtime.spawn(worker.run());
        debug!(
            "LOKI | Session started for {} (service: {}, batch size: {})",
            config.url, config.service_name, config.batch_size
        );

        Ok(Self {
            sink: LokiSink::new(shared, options.echo),
            cancel,
            scheduler,
            worker,
        })
    }

    /// Handle used to write log records. Cheap to clone.
    #[must_use]
    pub fn sink(&self) -> LokiSink {
        self.sink.clone()
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the session and waits for the final batch to be delivered or
    /// given up on.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.scheduler.await {
            error!("LOKI | Flush scheduler task failed: {e}");
        }
        if let Err(e) = self.worker.await {
            error!("LOKI | Delivery worker task failed: {e}");
        }
        debug!("LOKI | Session stopped");
    }
}
