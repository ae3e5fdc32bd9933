//! One end-to-end run: clear cookies, navigate through the redirect chain, verify
//! cookies, then compare the frozen timeline against the scenario.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cdp_adapter::BrowserSession;
use chrono::{DateTime, Utc};
use network_timeline::config::TimelineConfig;
use network_timeline::{ObservedEvent, Timeline};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cookies;
use crate::correlator::{Correlator, EventLog};
use crate::errors::{ErrorSink, FlowError};
use crate::expect::{match_timeline, MatchedStep};
use crate::metrics;
use crate::relay::{ContinuationRelay, ContinuationStats};
use crate::scenario::Scenario;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Deadline for the entry navigation to reach `load`.
    pub navigation_timeout_ms: u64,
    /// Upper bound for the whole run.
    pub run_timeout_ms: u64,
    /// Quiet period after `load` before cookies are checked; zero disables it.
    pub settle_ms: u64,
    /// Raw events kept for the failure report.
    pub event_log_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            navigation_timeout_ms: 30_000,
            run_timeout_ms: 60_000,
            settle_ms: 250,
            event_log_capacity: 256,
        }
    }
}

impl FlowConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStage {
    Idle,
    CookiesCleared,
    Navigating,
    NavigationComplete,
    CookiesVerified,
    Matched,
    Done,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlowOutcome {
    Passed,
    Failed {
        /// Last stage reached before the failure.
        stage: FlowStage,
        kind: String,
        error: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowReport {
    pub scenario: String,
    pub outcome: FlowOutcome,
    pub stages: Vec<FlowStage>,
    pub timeline: Vec<ObservedEvent>,
    pub matched: Vec<MatchedStep>,
    pub protocol_errors: Vec<String>,
    pub continuations: ContinuationStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub browser_log: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl FlowReport {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, FlowOutcome::Passed)
    }

    pub fn failure(&self) -> Option<(FlowStage, &str, &str)> {
        match &self.outcome {
            FlowOutcome::Passed => None,
            FlowOutcome::Failed { stage, kind, error } => Some((*stage, kind, error)),
        }
    }
}

#[derive(Debug)]
struct StageTracker {
    current: FlowStage,
    history: Vec<FlowStage>,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            current: FlowStage::Idle,
            history: vec![FlowStage::Idle],
        }
    }

    fn advance(&mut self, stage: FlowStage) {
        info!(target: "flowprobe::flow", from = ?self.current, to = ?stage, "stage reached");
        self.current = stage;
        self.history.push(stage);
    }
}

/// Per-run state shared with the event handler.
struct RunContext {
    timeline: Arc<Timeline>,
    relay: Arc<ContinuationRelay>,
    errors: Arc<ErrorSink>,
    log: Arc<EventLog>,
}

pub struct FlowRunner {
    session: Arc<dyn BrowserSession>,
    scenario: Scenario,
    config: FlowConfig,
    timeline: TimelineConfig,
    token: CancellationToken,
}

impl FlowRunner {
    pub fn new(session: Arc<dyn BrowserSession>, scenario: Scenario, config: FlowConfig) -> Self {
        Self {
            session,
            scenario,
            config,
            timeline: TimelineConfig::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn with_timeline_config(mut self, timeline: TimelineConfig) -> Self {
        self.timeline = timeline;
        self
    }

    /// Cancelling this token (or a parent of it) aborts the run.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub async fn run(&self) -> FlowReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let token = self.token.child_token();
        let errors = Arc::new(ErrorSink::default());
        let ctx = RunContext {
            timeline: Arc::new(Timeline::with_config(self.timeline.clone())),
            relay: Arc::new(ContinuationRelay::new(
                Arc::clone(&self.session),
                token.clone(),
                Arc::clone(&errors),
            )),
            errors,
            log: Arc::new(EventLog::new(self.config.event_log_capacity)),
        };
        let mut tracker = StageTracker::new();
        let mut matched = Vec::new();
        let mut listener = None;

        info!(
            target: "flowprobe::flow",
            scenario = %self.scenario.name,
            entry = %self.scenario.entry_url(),
            "flow run started"
        );

        let result = tokio::select! {
            _ = token.cancelled() => Err(FlowError::Cancelled),
            outcome = tokio::time::timeout(
                self.config.run_timeout(),
                self.drive(&ctx, &mut tracker, &mut matched, &mut listener),
            ) => match outcome {
                Ok(result) => result,
                Err(_) => Err(FlowError::Timeout(format!(
                    "run exceeded {:?}",
                    self.config.run_timeout()
                ))),
            },
        };

        if let Some(id) = listener {
            self.session.unlisten(id);
        }
        token.cancel();
        ctx.relay.drain().await;
        let timeline = ctx.timeline.freeze();

        let outcome = match result {
            Ok(()) => {
                tracker.advance(FlowStage::Done);
                FlowOutcome::Passed
            }
            Err(err) => {
                let stage = tracker.current;
                error!(target: "flowprobe::flow", ?stage, kind = err.kind(), %err, "flow failed");
                tracker.advance(FlowStage::Failed);
                FlowOutcome::Failed {
                    stage,
                    kind: err.kind().to_string(),
                    error: err.to_string(),
                }
            }
        };

        let passed = matches!(outcome, FlowOutcome::Passed);
        let elapsed = clock.elapsed();
        metrics::record_run(passed, elapsed);

        FlowReport {
            scenario: self.scenario.name.clone(),
            outcome,
            stages: tracker.history,
            timeline,
            matched,
            protocol_errors: ctx
                .errors
                .snapshot()
                .iter()
                .filter(|err| err.kind() == "protocol")
                .map(ToString::to_string)
                .collect(),
            continuations: ctx.relay.stats(),
            browser_log: if passed { Vec::new() } else { ctx.log.lines() },
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    async fn drive(
        &self,
        ctx: &RunContext,
        tracker: &mut StageTracker,
        matched: &mut Vec<MatchedStep>,
        listener: &mut Option<cdp_adapter::ListenerId>,
    ) -> Result<(), FlowError> {
        self.scenario.validate()?;
        let session = self.session.as_ref();

        session
            .enable_interception()
            .await
            .map_err(|err| FlowError::from_adapter("enabling interception", err))?;
        let correlator = Correlator::new(
            Arc::clone(&ctx.timeline),
            Arc::clone(&ctx.relay),
            Arc::clone(&ctx.errors),
        )
        .with_log(Arc::clone(&ctx.log));
        *listener = Some(session.listen(Arc::new(correlator).into_handler()));

        cookies::clear(session, &self.scenario).await?;
        tracker.advance(FlowStage::CookiesCleared);
        let jar = session
            .get_all_cookies()
            .await
            .map_err(|err| FlowError::from_adapter("reading cookies", err))?;
        cookies::verify_clean(&jar, &self.scenario.cookies)?;

        tracker.advance(FlowStage::Navigating);
        let entry = self.scenario.entry_url();
        session
            .navigate(&entry, self.config.navigation_timeout())
            .await
            .map_err(|err| FlowError::from_adapter(&format!("navigating to {entry}"), err))?;
        self.settle(ctx).await;
        tracker.advance(FlowStage::NavigationComplete);

        let jar = session
            .get_all_cookies()
            .await
            .map_err(|err| FlowError::from_adapter("reading cookies", err))?;
        cookies::verify_issued(&jar, &self.scenario.cookies)?;
        tracker.advance(FlowStage::CookiesVerified);

        ctx.relay.drain().await;
        let observed = ctx.timeline.freeze();
        let report = match_timeline(&self.scenario.expected, &observed)?;
        for step in &report.steps {
            info!(
                target: "flowprobe::flow",
                step = step.index + 1,
                url = %step.url,
                status = step.status_code,
                "step matched"
            );
        }
        *matched = report.steps;
        tracker.advance(FlowStage::Matched);

        if let Some(err) = ctx.errors.first_of("ordering") {
            return Err(err);
        }
        if let Some(err) = ctx.errors.first_of("protocol") {
            return Err(err);
        }
        Ok(())
    }

    /// Wait until the timeline stops growing and no continuation is pending.
    async fn settle(&self, ctx: &RunContext) {
        let quiet = self.config.settle();
        if quiet.is_zero() {
            return;
        }
        let deadline = Instant::now() + self.config.navigation_timeout();
        let mut last = ctx.timeline.len();
        loop {
            sleep(quiet).await;
            let len = ctx.timeline.len();
            if len == last && ctx.relay.in_flight() == 0 {
                debug!(target: "flowprobe::flow", entries = len, "timeline settled");
                return;
            }
            if Instant::now() >= deadline {
                warn!(target: "flowprobe::flow", entries = len, "timeline still changing at deadline");
                return;
            }
            last = len;
        }
    }
}
