//! Handles shared by every controller and driver in one run

use std::sync::Arc;

use crate::client::Connector;
use crate::ledger::DeliveryLedger;
use crate::stats::RunStats;

#[derive(Clone)]
pub struct RunContext {
    pub connector: Arc<dyn Connector>,
    pub ledger: Arc<DeliveryLedger>,
    pub stats: Arc<RunStats>,
}

impl RunContext {
    pub fn new(connector: Arc<dyn Connector>, stats: Arc<RunStats>) -> Self {
        Self {
            connector,
            ledger: Arc::new(DeliveryLedger::new()),
            stats,
        }
    }
}
