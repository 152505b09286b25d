//! Driving loop
//!
//! Calls a provider's run/remove operation until it succeeds, fails fatally
//! or the retry policy runs out. Every suggested delay is waited in full and
//! every call is bounded by a deadline.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use super::errors::{ScanError, ScanResult};
use super::provider::AssetScanProvider;
use super::types::ScanJobDescriptor;

/// Bounds of one driven operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Invocations before giving up
    pub max_attempts: u32,
    /// Wall-clock budget; a wait that would cross it is not started
    pub max_elapsed: Duration,
    /// Deadline of a single invocation
    pub call_timeout: Duration,
    /// Delay after an invocation hit its deadline
    pub timeout_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 360,
            max_elapsed: Duration::from_secs(3 * 60 * 60),
            call_timeout: Duration::from_secs(120),
            timeout_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Run,
    Remove,
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanPhase::Run => write!(f, "run"),
            ScanPhase::Remove => write!(f, "remove"),
        }
    }
}

/// Summary of a driven operation that succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveOutcome {
    pub phase: ScanPhase,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriveError {
    #[error("{phase} asset scan {asset_scan_id} failed on attempt {attempts}: {reason}")]
    Fatal {
        phase: ScanPhase,
        asset_scan_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("{phase} asset scan {asset_scan_id} gave up after {attempts} attempts in {}s: {last_reason}", .elapsed.as_secs())]
    Exhausted {
        phase: ScanPhase,
        asset_scan_id: String,
        attempts: u32,
        elapsed: Duration,
        last_reason: String,
    },
}

/// Retry-with-delay executor around one provider
pub struct ScanDriver {
    provider: Arc<dyn AssetScanProvider>,
    policy: RetryPolicy,
}

impl ScanDriver {
    pub fn new(provider: Arc<dyn AssetScanProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive `RunAssetScan` until the scanner is up.
    pub async fn run(&self, job: &ScanJobDescriptor) -> Result<DriveOutcome, DriveError> {
        self.drive(ScanPhase::Run, job).await
    }

    /// Drive `RemoveAssetScan` until every resource is gone.
    pub async fn remove(&self, job: &ScanJobDescriptor) -> Result<DriveOutcome, DriveError> {
        self.drive(ScanPhase::Remove, job).await
    }

    /// A single deadline-bounded invocation. An exceeded deadline is
    /// Retryable: the provider-side operation keeps going and is observed on
    /// the next call.
    pub async fn invoke(&self, phase: ScanPhase, job: &ScanJobDescriptor) -> ScanResult<()> {
        let call = async {
            match phase {
                ScanPhase::Run => self.provider.run_asset_scan(job).await,
                ScanPhase::Remove => self.provider.remove_asset_scan(job).await,
            }
        };

        match timeout(self.policy.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ScanError::retryable(
                self.policy.timeout_delay,
                format!(
                    "{} call exceeded its {}s deadline",
                    phase,
                    self.policy.call_timeout.as_secs()
                ),
            )),
        }
    }

    async fn drive(
        &self,
        phase: ScanPhase,
        job: &ScanJobDescriptor,
    ) -> Result<DriveOutcome, DriveError> {
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.invoke(phase, job).await {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    info!(
                        asset_scan_id = %job.asset_scan_id,
                        provider = %self.provider.kind(),
                        phase = %phase,
                        attempts,
                        elapsed_secs = elapsed.as_secs(),
                        "Asset scan operation complete"
                    );
                    return Ok(DriveOutcome {
                        phase,
                        attempts,
                        elapsed,
                    });
                }
                Err(ScanError::Fatal { reason }) => {
                    error!(
                        asset_scan_id = %job.asset_scan_id,
                        phase = %phase,
                        attempts,
                        reason = %reason,
                        "Asset scan operation failed"
                    );
                    return Err(DriveError::Fatal {
                        phase,
                        asset_scan_id: job.asset_scan_id.to_string(),
                        attempts,
                        reason,
                    });
                }
                Err(ScanError::Retryable { delay, reason }) => {
                    let elapsed = started.elapsed();

                    if attempts >= self.policy.max_attempts
                        || elapsed + delay > self.policy.max_elapsed
                    {
                        warn!(
                            asset_scan_id = %job.asset_scan_id,
                            phase = %phase,
                            attempts,
                            reason = %reason,
                            "Retry budget exhausted"
                        );
                        return Err(DriveError::Exhausted {
                            phase,
                            asset_scan_id: job.asset_scan_id.to_string(),
                            attempts,
                            elapsed,
                            last_reason: reason,
                        });
                    }

                    info!(
                        asset_scan_id = %job.asset_scan_id,
                        phase = %phase,
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        reason = %reason,
                        "Not ready, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
