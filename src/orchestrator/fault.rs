//! Fault injection
//!
//! Targets are disconnected gracefully (the broker keeps their sessions)
//! and, after a settle delay, reconnected under the same identity while the
//! publishers keep going. In mass mode every target acts at the trigger; in
//! staggered mode target `i` acts `i * stagger` after it.

use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{FaultConfig, FaultModeConfig};
use crate::session::SessionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    Mass,
    Staggered { stagger: Duration },
}

impl FaultMode {
    /// Delay of target `index` after the trigger
    pub fn offset(&self, index: usize) -> Duration {
        match self {
            FaultMode::Mass => Duration::ZERO,
            FaultMode::Staggered { stagger } => {
                stagger.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FaultPlan {
    pub mode: FaultMode,
    pub settle_delay: Duration,
}

impl From<&FaultConfig> for FaultPlan {
    fn from(config: &FaultConfig) -> Self {
        let mode = match config.mode {
            FaultModeConfig::Mass => FaultMode::Mass,
            FaultModeConfig::Staggered => FaultMode::Staggered {
                stagger: config.stagger,
            },
        };
        Self {
            mode,
            settle_delay: config.settle_delay,
        }
    }
}

/// What happened to one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultAction {
    pub identity: String,
    /// Filter resubscribed on reconnect
    pub filter: Option<String>,
    #[serde(with = "humantime_serde")]
    pub disconnected_after: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnected_after: Option<Duration>,
    pub expiry_exceeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultOutcome {
    pub mode: String,
    pub actions: Vec<FaultAction>,
}

impl FaultOutcome {
    pub fn reconnected(&self) -> usize {
        self.actions.iter().filter(|a| a.error.is_none()).count()
    }
}

/// Every controller in plain mode; the first member of each group otherwise
pub fn select_targets(controllers: &[SessionController]) -> Vec<SessionController> {
    let mut seen_groups = Vec::new();
    controllers
        .iter()
        .filter(|c| match c.group() {
            None => true,
            Some(group) if seen_groups.iter().any(|g| g == group) => false,
            Some(group) => {
                seen_groups.push(group.to_string());
                true
            }
        })
        .cloned()
        .collect()
}

/// Disconnect and reconnect every target according to the plan
pub async fn inject(plan: FaultPlan, targets: Vec<SessionController>) -> FaultOutcome {
    let trigger = Instant::now();
    info!(
        "Fault injection: {} target(s), mode {:?}, settle {:?}",
        targets.len(),
        plan.mode,
        plan.settle_delay
    );

    let actions = join_all(targets.into_iter().enumerate().map(|(index, controller)| async move {
        tokio::time::sleep_until(trigger + plan.mode.offset(index)).await;
        controller.disconnect().await;
        let disconnected_after = trigger.elapsed();

        tokio::time::sleep(plan.settle_delay).await;
        let result = controller.reconnect().await;
        let reconnected_after = trigger.elapsed();

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                warn!("Fault injection reconnect failed: {}", e);
                Some(e.to_string())
            }
        };
        FaultAction {
            identity: controller.identity().to_string(),
            filter: controller.last_filter(),
            disconnected_after,
            reconnected_after: error.is_none().then_some(reconnected_after),
            expiry_exceeded: controller.expiry_exceeded(),
            error,
        }
    }))
    .await;

    let outcome = FaultOutcome {
        mode: match plan.mode {
            FaultMode::Mass => "mass".to_string(),
            FaultMode::Staggered { .. } => "staggered".to_string(),
        },
        actions,
    };
    info!(
        "Fault injection done: {}/{} reconnected",
        outcome.reconnected(),
        outcome.actions.len()
    );
    outcome
}
