//! Test runner
//!
//! Spawns one task per VU at its ramp-up offset, holds every task to the
//! test deadline and reports how the run went. A [`SimError`] from any VU
//! cancels the rest and fails the run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ApiClient, HttpRequest, IdentityProvider, Transport};
use crate::config::Config;
use crate::dispatch::ActionOutcome;
use crate::lifecycle::{Lifecycle, Pacer, RampError, RampPlan};
use crate::metrics::{self, Metrics, MetricsSink};
use crate::vu::{SimContext, SimError, VirtualUser, naming};

/// Seconds between polls of the setup flag.
const SETUP_POLL: f64 = 10.0;
/// Seconds between heartbeat checks.
const HEARTBEAT_INTERVAL: f64 = 10.0;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Ramp(#[from] RampError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error("Setup failed: {0}")]
    Setup(String),
    #[error("VU task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// How one VU task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuExit {
    /// Ramp-down or the deadline stopped it
    Finished,
    /// A fatal error stopped it early
    Aborted,
    /// The deadline fired before its start offset
    NotStarted,
    /// Ran the heartbeat monitor instead of a session
    Monitor,
}

/// Per-run tallies of VU exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub finished: u32,
    pub aborted: u32,
    pub not_started: u32,
}

impl RunSummary {
    fn record(&mut self, exit: VuExit) {
        match exit {
            VuExit::Finished => self.finished += 1,
            VuExit::Aborted => self.aborted += 1,
            VuExit::NotStarted => self.not_started += 1,
            VuExit::Monitor => {}
        }
    }
}

pub struct Runner {
    config: Arc<Config>,
    plan: Arc<RampPlan>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, RunError> {
        let plan = RampPlan::new(&config.stages, config.vus_max)?;
        Ok(Self {
            config: Arc::new(config),
            plan: Arc::new(plan),
            transport,
            identity,
            metrics,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling this token ends the run early.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<RunSummary, RunError> {
        let pacer = Pacer::new(
            self.config.enable_delays,
            self.config.delay_scale,
            self.cancel.clone(),
        );
        let sink: Arc<dyn MetricsSink> = self.metrics.clone();
        let ctx = SimContext::new(
            self.config.clone(),
            self.transport.clone(),
            self.identity.clone(),
            sink,
            pacer.clone(),
        )?;
        if let Some(test_id) = &self.config.test_id {
            self.setup_barrier(&ctx, test_id).await?;
        }

        let test_start = Instant::now();
        let deadline = self.plan.test_duration() + self.config.grace_period;
        info!(
            "Starting test: vusMax={}, duration={:.1}s, rampDownStart={:.1}s",
            self.config.vus_max,
            self.plan.test_duration().as_secs_f64(),
            self.plan.ramp_down_start().as_secs_f64()
        );
        let watchdog = spawn_deadline(self.cancel.clone(), deadline);

        let base_seed = self.config.seed.unwrap_or_else(rand::random);
        let mut tasks = JoinSet::new();
        for ordinal in 1..=self.config.vus_max {
            let Some(offset) = self.plan.start_offset(ordinal) else {
                debug!("VU {} is never reached by the ramp", ordinal);
                continue;
            };
            if self.config.heartbeat && ordinal == 1 {
                let url = self.config.health_url();
                let transport = self.transport.clone();
                let plan = self.plan.clone();
                let pacer = pacer.clone();
                tasks.spawn(async move { heartbeat(transport, url, plan, pacer, test_start).await });
                continue;
            }
            let lifecycle = Lifecycle::new(self.plan.clone(), ordinal, test_start, pacer.clone());
            let ctx = ctx.clone();
            let seed = base_seed ^ (u64::from(ordinal) << 32);
            tasks.spawn(async move {
                if !ctx.pacer.sleep(offset).await {
                    return Ok(VuExit::NotStarted);
                }
                run_vu(ctx, lifecycle, seed).await
            });
        }

        let mut summary = RunSummary::default();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(exit)) => summary.record(exit),
                Ok(Err(e)) => {
                    error!("Stopping the run: {}", e);
                    self.cancel.cancel();
                    failure.get_or_insert(RunError::Sim(e));
                }
                Err(e) => {
                    error!("VU task failed: {}", e);
                    self.cancel.cancel();
                    failure.get_or_insert(RunError::Join(e));
                }
            }
        }
        self.cancel.cancel();
        watchdog.abort();

        info!(
            "Test finished: {} VUs finished, {} aborted, {} never started",
            summary.finished, summary.aborted, summary.not_started
        );
        for line in self.metrics.summary_lines() {
            info!("{}", line);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Task 0 marks the shared test setup as done; other tasks wait for it.
    async fn setup_barrier(&self, ctx: &SimContext, test_id: &str) -> Result<(), RunError> {
        let instance = naming::instance_number(self.config.task_index, self.config.vus_max, 1)
            .ok_or_else(|| RunError::Setup(format!("task {} has no instance numbers", self.config.task_index)))?;
        let mut api = ApiClient::new(
            ctx.transport.clone(),
            ctx.identity.clone(),
            ctx.metrics.clone(),
            ctx.pacer.clone(),
            ctx.settings.clone(),
            instance,
        );
        api.auth(&naming::username(instance))
            .await
            .map_err(|e| RunError::Setup(e.to_string()))?;

        if self.config.task_index == 0 {
            for value in [false, true] {
                let result = api
                    .post(
                        "testing/flags",
                        &json!({ "testId": test_id, "key": "setup", "value": value }),
                    )
                    .await;
                if let Some(e) = result.error {
                    return Err(RunError::Setup(e.to_string()));
                }
            }
            info!("Setup complete for test {}", test_id);
            return Ok(());
        }

        loop {
            let result = api.get(&format!("testing/flags/{test_id}/setup")).await;
            if let Some(e) = result.error {
                return Err(RunError::Setup(e.to_string()));
            }
            if result.data() == Some(&Value::Bool(true)) {
                info!("Setup of test {} is done", test_id);
                return Ok(());
            }
            debug!("Waiting for setup of test {}", test_id);
            if !ctx.pacer.delay(SETUP_POLL).await {
                return Err(RunError::Setup("cancelled while waiting for setup".into()));
            }
        }
    }
}

fn spawn_deadline(cancel: CancellationToken, deadline: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                info!("Test deadline reached after {:.1}s", deadline.as_secs_f64());
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}

/// Repeat session iterations until the VU's lifecycle ends.
async fn run_vu(ctx: SimContext, mut lifecycle: Lifecycle, seed: u64) -> Result<VuExit, SimError> {
    let ordinal = lifecycle.ordinal();
    let mut iteration = 0u64;
    loop {
        if !lifecycle.is_active() {
            return Ok(VuExit::Finished);
        }
        ctx.metrics.counter(metrics::SESSIONS, 1, &[]);
        let started = Instant::now();
        let mut vu = VirtualUser::new(&ctx, lifecycle.clone(), seed.wrapping_add(iteration))?;
        if iteration == 0 {
            info!("VU {}: phone {}", ordinal, vu.phone());
        }
        let outcome = vu.run_session().await?;
        ctx.metrics.trend(
            metrics::SESSION_DURATION,
            started.elapsed().as_secs_f64() * 1000.0,
            &[],
        );
        iteration += 1;
        match outcome {
            ActionOutcome::Suspend => debug!("VU {}: session {} suspended", ordinal, iteration),
            ActionOutcome::FatalAbort => {
                error!("VU {}: aborted after {} sessions", ordinal, iteration);
                return Ok(VuExit::Aborted);
            }
            other => {
                info!("VU {}: stopped ({:?}) after {} sessions", ordinal, other, iteration);
                return Ok(VuExit::Finished);
            }
        }
    }
}

/// Poll the health endpoint until the end of the test.
async fn heartbeat(
    transport: Arc<dyn Transport>,
    url: String,
    plan: Arc<RampPlan>,
    pacer: Pacer,
    test_start: Instant,
) -> Result<VuExit, SimError> {
    let (mut succeeded, mut failed) = (0u64, 0u64);
    while test_start.elapsed() < plan.test_duration() {
        let started = Instant::now();
        let response = transport.send(HttpRequest::get(url.as_str())).await;
        if response.status == Some(200) {
            succeeded += 1;
        } else {
            failed += 1;
            warn!("Heartbeat failed: {:?} {:?}", response.status, response.failure);
        }
        info!(
            "{} succ {} fail {:.3} rt",
            succeeded,
            failed,
            started.elapsed().as_secs_f64()
        );
        if !pacer.delay(HEARTBEAT_INTERVAL).await {
            break;
        }
    }
    Ok(VuExit::Monitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_ignores_monitor() {
        let mut summary = RunSummary::default();
        for exit in [
            VuExit::Finished,
            VuExit::Aborted,
            VuExit::Monitor,
            VuExit::NotStarted,
            VuExit::Finished,
        ] {
            summary.record(exit);
        }
        assert_eq!(
            summary,
            RunSummary {
                finished: 2,
                aborted: 1,
                not_started: 1,
            }
        );
    }
}
