//! Fan-out of channel joins across many accounts.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::DEFAULT_WORKERS,
    domain::{AccountId, ChannelRef},
    errors::Error,
    manager::SessionManager,
    platform::types::JoinResponse,
    pool::run_bounded,
    Result,
};

/// Final classification of one (account, channel) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    PermissionDenied,
    NotFound,
    /// Still rate limited after the single retry.
    RateLimited,
    Error,
}

impl JoinOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, JoinOutcome::Joined | JoinOutcome::AlreadyMember)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JoinOutcome::Joined => "Joined",
            JoinOutcome::AlreadyMember => "AlreadyMember",
            JoinOutcome::PermissionDenied => "PermissionDenied",
            JoinOutcome::NotFound => "NotFound",
            JoinOutcome::RateLimited => "RateLimited",
            JoinOutcome::Error => "Error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinResult {
    pub account: AccountId,
    pub channel: ChannelRef,
    pub outcome: JoinOutcome,
    /// Human-readable cause for failures.
    pub detail: Option<String>,
}

/// Outcome of a batch. `results` is in completion order.
#[derive(Clone, Debug, Default)]
pub struct JoinReport {
    pub results: Vec<JoinResult>,
    /// Distinct pairs in the batch, after duplicates were dropped.
    pub total: usize,
    /// Cancelled before every pair finished; `results` holds the finished ones.
    pub cancelled: bool,
}

impl JoinReport {
    pub fn outcome(&self, account: AccountId, channel: &ChannelRef) -> Option<JoinOutcome> {
        self.results
            .iter()
            .find(|r| r.account == account && &r.channel == channel)
            .map(|r| r.outcome)
    }

    pub fn count(&self, outcome: JoinOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct JoinConfig {
    /// Maximum number of pairs in flight.
    pub workers: usize,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

pub struct JoinOrchestrator {
    manager: Arc<SessionManager>,
    config: JoinConfig,
}

impl JoinOrchestrator {
    pub fn new(manager: Arc<SessionManager>, config: JoinConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Join every account to every channel and report one result per pair.
    pub async fn run(&self, accounts: &[AccountId], channels: &[ChannelRef]) -> JoinReport {
        self.run_with_cancel(accounts, channels, CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        accounts: &[AccountId],
        channels: &[ChannelRef],
        cancel: CancellationToken,
    ) -> JoinReport {
        let pairs = pairs(accounts, channels);
        if pairs.is_empty() {
            return JoinReport::default();
        }
        let total = pairs.len();

        let workers = self.config.workers.max(1);
        info!(pairs = pairs.len(), workers, "starting join batch");

        let manager = self.manager.clone();
        let out = run_bounded(pairs, workers, cancel, move |(account, channel)| {
            let manager = manager.clone();
            async move { join_pair(&manager, account, channel).await }
        })
        .await;

        let report = JoinReport {
            results: out.results,
            total,
            cancelled: out.cancelled,
        };
        if report.cancelled {
            warn!(finished = report.len(), total, "join batch cancelled");
        } else {
            info!(
                total = report.len(),
                succeeded = report.succeeded(),
                "join batch finished"
            );
        }
        report
    }
}

/// Cartesian product with duplicate pairs removed, in input order.
fn pairs(accounts: &[AccountId], channels: &[ChannelRef]) -> Vec<(AccountId, ChannelRef)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for &account in accounts {
        for channel in channels {
            if seen.insert((account, channel.clone())) {
                out.push((account, channel.clone()));
            }
        }
    }
    out
}

enum Step {
    Done(JoinOutcome, Option<String>),
    Throttled(Duration),
}

async fn join_pair(
    manager: &SessionManager,
    account: AccountId,
    channel: ChannelRef,
) -> JoinResult {
    let mut retried = false;
    let (outcome, detail) = loop {
        match classify(attempt(manager, account, &channel).await) {
            Step::Done(outcome, detail) => break (outcome, detail),
            Step::Throttled(retry_after) if !retried => {
                debug!(
                    account = %account,
                    channel = %channel,
                    wait_secs = retry_after.as_secs(),
                    "rate limited, retrying once"
                );
                retried = true;
                sleep(retry_after).await;
            }
            Step::Throttled(retry_after) => {
                break (
                    JoinOutcome::RateLimited,
                    Some(format!("retry after {}s", retry_after.as_secs())),
                )
            }
        }
    };

    if let Some(detail) = &detail {
        debug!(account = %account, channel = %channel, outcome = outcome.as_str(), "{detail}");
    }
    JoinResult {
        account,
        channel,
        outcome,
        detail,
    }
}

async fn attempt(
    manager: &SessionManager,
    account: AccountId,
    channel: &ChannelRef,
) -> Result<JoinResponse> {
    let handle = manager.acquire(account).await?;
    let res = manager
        .timed(manager.client().join_channel(&handle, channel))
        .await;
    if matches!(res, Err(Error::Connection(_) | Error::Timeout(_))) {
        manager.release_handle(&handle).await;
    }
    res
}

fn classify(res: Result<JoinResponse>) -> Step {
    match res {
        Ok(JoinResponse::Joined) => Step::Done(JoinOutcome::Joined, None),
        Ok(JoinResponse::AlreadyMember) => Step::Done(JoinOutcome::AlreadyMember, None),
        Ok(JoinResponse::PermissionDenied) => Step::Done(JoinOutcome::PermissionDenied, None),
        Ok(JoinResponse::NotFound) => Step::Done(JoinOutcome::NotFound, None),
        Ok(JoinResponse::RateLimited { retry_after }) => Step::Throttled(retry_after),
        Err(Error::RateLimited { retry_after }) => Step::Throttled(retry_after),
        Err(e @ Error::PermissionDenied(_)) => {
            Step::Done(JoinOutcome::PermissionDenied, Some(e.to_string()))
        }
        Err(e @ Error::TargetNotFound(_)) => Step::Done(JoinOutcome::NotFound, Some(e.to_string())),
        Err(e) => Step::Done(JoinOutcome::Error, Some(e.to_string())),
    }
}
