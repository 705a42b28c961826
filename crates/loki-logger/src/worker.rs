// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::formatter::BatchFormatter;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Drains the delivery queue one batch at a time.
///
/// Batches are shipped in the order they were queued. The worker exits once
/// every sender is gone and the queue is empty, which is how a shutdown flush
/// is guaranteed to be attempted before the session ends.
pub(crate) struct DeliveryWorker {
    rx: mpsc::Receiver<Vec<String>>,
    formatter: BatchFormatter,
    transport: Arc<Transport>,
}

impl DeliveryWorker {
    pub(crate) fn new(
        rx: mpsc::Receiver<Vec<String>>,
        formatter: BatchFormatter,
        transport: Arc<Transport>,
    ) -> Self {
        Self {
            rx,
            formatter,
            transport,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("LOKI | Delivery worker started");
        while let Some(lines) = self.rx.recv().await {
            let batch = self.formatter.format(&lines);
            if batch.is_empty() {
                continue;
            }
            // Failures are logged by the transport and the batch is discarded.
            let _ = self.transport.deliver(&batch).await;
        }
        self.transport.close().await;
        debug!("LOKI | Delivery worker stopped");
    }
}
