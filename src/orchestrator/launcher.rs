//! Batched client start-up
//!
//! Thousands of simulated clients connecting at once is a connection storm,
//! not a delivery test. The launcher starts `batch_size` operations
//! concurrently, waits for the whole batch, pauses `batch_delay`, and moves
//! on to the next batch.

use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct BatchLauncher {
    batch_size: usize,
    batch_delay: Duration,
}

impl BatchLauncher {
    pub fn new(batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_delay,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run `start` for every item, batch by batch. Results keep input order.
    pub async fn launch<I, F, Fut>(&self, items: I, mut start: F) -> Vec<Fut::Output>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future,
    {
        let mut items = items.into_iter().peekable();
        let mut results = Vec::new();
        let mut batch = 0usize;

        while items.peek().is_some() {
            if batch > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            let pending: Vec<Fut> = items.by_ref().take(self.batch_size).map(&mut start).collect();
            debug!("Launching batch {} ({} clients)", batch + 1, pending.len());
            results.extend(join_all(pending).await);
            batch += 1;
        }

        results
    }
}
