//! Step context
//!
//! The stateful object handed to workflow bodies. Every method consults the
//! step cache first: completed steps short-circuit with their persisted
//! result, suspended steps re-raise their interrupt, and only uncached steps
//! execute for real. `run` write-aheads its row before invoking the body so
//! a crash mid-execution is detected on the next replay as a lost attempt.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::interrupt::{Interrupt, RunError, RunResult};
use crate::live::LiveShared;
use crate::observe::{Collector, ObservabilityProvider};
use crate::persistence::{
    InstanceStore, RetryAttempt, StepRow, StepStatus, StepType,
};
use crate::retry::{OverflowPolicy, ResultSizeLimit, RetryOverride, RetryPolicy};
use crate::schema::Schema;
use crate::units::parse_duration;

/// Marker wrapper that short-circuits retries for a `run` step.
///
/// Return `Err(non_retriable(...))` from a step body to fail the step on the
/// first attempt regardless of the retry policy.
#[derive(Debug)]
pub struct NonRetriable(pub anyhow::Error);

impl std::fmt::Display for NonRetriable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NonRetriable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Wrap an error so the step fails without retrying.
pub fn non_retriable(err: impl Into<anyhow::Error>) -> anyhow::Error {
    anyhow::Error::new(NonRetriable(err.into()))
}

/// Per-call options for a `run` step.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Retry override, merged field-by-field over the workflow defaults.
    pub retries: RetryOverride,
}

impl StepOptions {
    pub fn retries(retries: RetryOverride) -> Self {
        Self { retries }
    }
}

/// Stateful API handed to a workflow body for one replay cycle.
pub struct StepContext {
    store: Arc<dyn InstanceStore>,
    clock: Clock,
    defaults: RetryPolicy,
    limit: ResultSizeLimit,
    events: Arc<HashMap<String, Schema>>,
    provider: Arc<dyn ObservabilityProvider>,
    collector: Arc<Mutex<Collector>>,
    live: Arc<LiveShared>,
    used_names: HashSet<String>,
    result_bytes: u64,
    executed: bool,
    paused: bool,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn InstanceStore>,
        clock: Clock,
        defaults: RetryPolicy,
        limit: ResultSizeLimit,
        events: Arc<HashMap<String, Schema>>,
        provider: Arc<dyn ObservabilityProvider>,
        collector: Arc<Mutex<Collector>>,
        live: Arc<LiveShared>,
        paused: bool,
    ) -> Self {
        Self {
            store,
            clock,
            defaults,
            limit,
            events,
            provider,
            collector,
            live,
            used_names: HashSet::new(),
            result_bytes: 0,
            executed: false,
            paused,
        }
    }

    /// Execute a named step with the workflow's default retry policy.
    ///
    /// The body runs at most once per attempt; once the step completes, its
    /// cached result is returned on every subsequent replay without invoking
    /// the body again.
    pub async fn run<F, Fut, T>(&mut self, name: &str, body: F) -> RunResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Serialize + DeserializeOwned + Send,
    {
        self.run_with(name, StepOptions::default(), body).await
    }

    /// Execute a named step with per-call options.
    pub async fn run_with<F, Fut, T>(
        &mut self,
        name: &str,
        options: StepOptions,
        body: F,
    ) -> RunResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Serialize + DeserializeOwned + Send,
    {
        self.claim(name, "run")?;
        let retries = self.defaults.merge(&options.retries);
        let now = self.clock.now_ms();

        let mut row = match self.store.get_step(name).await.map_err(EngineError::from)? {
            Some(row) => match row.status {
                StepStatus::Completed => {
                    let value = row.result.unwrap_or(Value::Null);
                    self.result_bytes += encoded_len(&value)?;
                    return decode_result(name, value).map_err(RunError::from);
                }
                StepStatus::Failed => match row.wake_at {
                    Some(wake_at) if wake_at > now => {
                        // Retry pending; suspend until it is due.
                        return Err(Interrupt::Sleep {
                            step: name.to_string(),
                            wake_at,
                        }
                        .into());
                    }
                    Some(_) => row,
                    None => {
                        // Retries exhausted in an earlier cycle; resurrect
                        // the stored error.
                        let err = row
                            .error
                            .as_deref()
                            .map(EngineError::from_transport)
                            .unwrap_or_else(|| {
                                EngineError::step_failed(name, "unknown failure")
                            });
                        return Err(err.into());
                    }
                },
                StepStatus::Running => {
                    return Err(self.recover_crashed(row, &retries, now).await);
                }
                StepStatus::Sleeping => {
                    return Err(Interrupt::Sleep {
                        step: name.to_string(),
                        wake_at: row.wake_at.unwrap_or(now),
                    }
                    .into());
                }
                StepStatus::Waiting => {
                    return Err(Interrupt::Wait {
                        step: name.to_string(),
                        timeout_at: row.wake_at,
                    }
                    .into());
                }
            },
            None => StepRow::new(name, StepType::Do, StepStatus::Running),
        };

        // Write-ahead: if the process dies inside the body, the next replay
        // finds a running row and treats it as a lost attempt.
        row.status = StepStatus::Running;
        row.started_at = Some(now);
        row.attempts += 1;
        row.wake_at = None;
        self.store.upsert_step(&row).await.map_err(EngineError::from)?;

        self.note_execution();
        self.provider
            .on_step_start(&mut self.collector.lock(), name, StepType::Do, now);

        let outcome = body().await;
        let finished = self.clock.now_ms();
        let duration = finished - now;

        match outcome {
            Ok(value) => {
                let encoded = serde_json::to_value(&value).map_err(|e| {
                    EngineError::internal(format!(
                        "failed to encode result of step {name:?}: {e}"
                    ))
                })?;
                let len = encoded_len(&encoded)?;

                if self.result_bytes + len > self.limit.max_size {
                    let message = format!(
                        "step {name:?} result of {len} bytes exceeds the workflow result size limit ({} of {} bytes already used)",
                        self.result_bytes, self.limit.max_size
                    );
                    let non_retriable = self.limit.on_overflow == OverflowPolicy::Fail;
                    return Err(self
                        .fail_attempt(row, message, None, non_retriable, &retries, finished, duration)
                        .await);
                }

                row.status = StepStatus::Completed;
                row.result = Some(encoded);
                row.error = None;
                row.error_stack = None;
                row.wake_at = None;
                row.completed_at = Some(finished);
                row.duration_ms = Some(duration);
                self.store.upsert_step(&row).await.map_err(EngineError::from)?;

                self.result_bytes += len;
                self.provider.on_step_complete(
                    &mut self.collector.lock(),
                    name,
                    StepType::Do,
                    duration,
                    finished,
                );
                Ok(value)
            }
            Err(err) => {
                let non_retriable = err.chain().any(|cause| cause.is::<NonRetriable>());
                let message = err.to_string();
                let stack = Some(format!("{err:?}"));
                Err(self
                    .fail_attempt(row, message, stack, non_retriable, &retries, finished, duration)
                    .await)
            }
        }
    }

    /// Suspend the workflow for a wall-clock duration (`"5s"`, `"1h"`, ...).
    pub async fn sleep(&mut self, name: &str, duration: &str) -> RunResult<()> {
        let millis = parse_duration(duration).map_err(EngineError::from)?;
        self.sleep_inner(name, "sleep", StepType::Sleep, move |now| now + millis)
            .await
    }

    /// Suspend the workflow until an absolute time.
    pub async fn sleep_until(&mut self, name: &str, until: DateTime<Utc>) -> RunResult<()> {
        let wake_at = until.timestamp_millis();
        self.sleep_inner(name, "sleep_until", StepType::SleepUntil, move |_| wake_at)
            .await
    }

    async fn sleep_inner(
        &mut self,
        name: &str,
        method: &str,
        step_type: StepType,
        wake: impl FnOnce(i64) -> i64,
    ) -> RunResult<()> {
        self.claim(name, method)?;
        let now = self.clock.now_ms();

        match self.store.get_step(name).await.map_err(EngineError::from)? {
            Some(row) => match row.status {
                StepStatus::Completed => Ok(()),
                StepStatus::Sleeping => Err(Interrupt::Sleep {
                    step: name.to_string(),
                    wake_at: row.wake_at.unwrap_or(now),
                }
                .into()),
                other => Err(EngineError::internal(format!(
                    "step {name:?} has unexpected status {:?} for a {} step",
                    other.as_str(),
                    step_type.as_str()
                ))
                .into()),
            },
            None => {
                let wake_at = wake(now);
                let mut row = StepRow::new(name, step_type, StepStatus::Sleeping);
                row.started_at = Some(now);
                row.wake_at = Some(wake_at);
                self.store.upsert_step(&row).await.map_err(EngineError::from)?;

                self.provider
                    .on_step_start(&mut self.collector.lock(), name, step_type, now);
                Err(Interrupt::Sleep {
                    step: name.to_string(),
                    wake_at,
                }
                .into())
            }
        }
    }

    /// Wait for an externally delivered event, without a timeout.
    pub async fn wait_for_event<T: DeserializeOwned>(&mut self, name: &str) -> RunResult<T> {
        self.wait_inner(name, None).await
    }

    /// Wait for an externally delivered event, failing with `EVENT_TIMEOUT`
    /// after the given duration.
    pub async fn wait_for_event_within<T: DeserializeOwned>(
        &mut self,
        name: &str,
        timeout: &str,
    ) -> RunResult<T> {
        let millis = parse_duration(timeout).map_err(EngineError::from)?;
        self.wait_inner(name, Some(millis)).await
    }

    async fn wait_inner<T: DeserializeOwned>(
        &mut self,
        name: &str,
        timeout_ms: Option<i64>,
    ) -> RunResult<T> {
        self.claim(name, "wait_for_event")?;
        let now = self.clock.now_ms();

        match self.store.get_step(name).await.map_err(EngineError::from)? {
            Some(row) => match row.status {
                StepStatus::Completed => {
                    decode_result(name, row.result.unwrap_or(Value::Null)).map_err(RunError::from)
                }
                StepStatus::Failed => {
                    // Timed out in an earlier cycle; resurrect the stored
                    // error envelope.
                    let err = row
                        .error
                        .as_deref()
                        .map(EngineError::from_transport)
                        .unwrap_or_else(|| EngineError::event_timeout(name));
                    Err(err.into())
                }
                StepStatus::Waiting => Err(Interrupt::Wait {
                    step: name.to_string(),
                    timeout_at: row.wake_at,
                }
                .into()),
                other => Err(EngineError::internal(format!(
                    "step {name:?} has unexpected status {:?} for a wait_for_event step",
                    other.as_str()
                ))
                .into()),
            },
            None => {
                if let Some(buffered) =
                    self.store.take_event(name).await.map_err(EngineError::from)?
                {
                    let schema = self.events.get(name).ok_or_else(|| {
                        EngineError::event_invalid(format!(
                            "workflow declares no event {name:?}"
                        ))
                    })?;
                    schema.validate(&buffered.payload).map_err(|e| {
                        EngineError::event_invalid(format!("event {name:?}: {e}"))
                    })?;

                    let mut row = StepRow::new(name, StepType::WaitForEvent, StepStatus::Completed);
                    row.result = Some(buffered.payload.clone());
                    row.started_at = Some(now);
                    row.completed_at = Some(now);
                    row.duration_ms = Some(0);
                    self.store.upsert_step(&row).await.map_err(EngineError::from)?;

                    self.provider.on_step_complete(
                        &mut self.collector.lock(),
                        name,
                        StepType::WaitForEvent,
                        0,
                        now,
                    );
                    decode_result(name, buffered.payload).map_err(RunError::from)
                } else {
                    let timeout_at = timeout_ms.map(|ms| now + ms);
                    let mut row = StepRow::new(name, StepType::WaitForEvent, StepStatus::Waiting);
                    row.started_at = Some(now);
                    row.wake_at = timeout_at;
                    self.store.upsert_step(&row).await.map_err(EngineError::from)?;

                    self.provider.on_step_start(
                        &mut self.collector.lock(),
                        name,
                        StepType::WaitForEvent,
                        now,
                    );
                    Err(Interrupt::Wait {
                        step: name.to_string(),
                        timeout_at,
                    }
                    .into())
                }
            }
        }
    }

    /// Total encoded bytes charged against the result-size budget so far.
    pub fn result_bytes(&self) -> u64 {
        self.result_bytes
    }

    fn claim(&mut self, name: &str, method: &str) -> Result<(), RunError> {
        if !self.used_names.insert(name.to_string()) {
            return Err(EngineError::validation(format!(
                "Duplicate step name {name:?} in call to {method}()"
            ))
            .into());
        }
        if self.paused {
            return Err(Interrupt::Pause.into());
        }
        Ok(())
    }

    fn note_execution(&mut self) {
        if !self.executed {
            self.executed = true;
            // First real execution of the cycle: leave replay mode so live
            // updates start flowing again.
            self.live.exit_replay();
        }
    }

    async fn recover_crashed(
        &mut self,
        row: StepRow,
        retries: &RetryPolicy,
        now: i64,
    ) -> RunError {
        warn!(step = %row.name, attempts = row.attempts, "found running step row, treating as crashed attempt");
        let duration = row.started_at.map(|s| now - s).unwrap_or(0);
        self.fail_attempt(
            row,
            "Loss of isolate".to_string(),
            None,
            false,
            retries,
            now,
            duration,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_attempt(
        &mut self,
        mut row: StepRow,
        message: String,
        stack: Option<String>,
        non_retriable: bool,
        retries: &RetryPolicy,
        finished: i64,
        duration: i64,
    ) -> RunError {
        row.retry_history.push(RetryAttempt {
            attempt: row.attempts,
            error: message.clone(),
            error_stack: stack.clone(),
            timestamp: finished,
            duration_ms: duration,
        });
        row.error = Some(message.clone());
        row.error_stack = stack;
        row.duration_ms = Some(duration);

        if non_retriable || row.attempts >= retries.limit {
            row.status = StepStatus::Failed;
            row.wake_at = None;
            let exhausted =
                EngineError::step_retry_exhausted(&row.name, row.attempts, &message);
            if let Err(e) = self.store.upsert_step(&row).await {
                return RunError::Fail(e.into());
            }
            RunError::Fail(exhausted)
        } else {
            let wake_at =
                finished + retries.delay_for_attempt(row.attempts).as_millis() as i64;
            row.status = StepStatus::Failed;
            row.wake_at = Some(wake_at);
            if let Err(e) = self.store.upsert_step(&row).await {
                return RunError::Fail(e.into());
            }
            self.provider.on_step_retry(
                &mut self.collector.lock(),
                &row.name,
                row.attempts,
                &message,
                row.error_stack.as_deref(),
                wake_at,
                finished,
            );
            RunError::Suspend(Interrupt::Sleep {
                step: row.name.clone(),
                wake_at,
            })
        }
    }
}

fn encoded_len(value: &Value) -> Result<u64, EngineError> {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len() as u64)
        .map_err(|e| EngineError::internal(format!("failed to measure encoded result: {e}")))
}

fn decode_result<T: DeserializeOwned>(name: &str, value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| {
        EngineError::internal(format!("failed to decode result of step {name:?}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::observe::DisabledObservability;
    use crate::persistence::MemoryStore;
    use crate::retry::Backoff;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context(store: Arc<MemoryStore>) -> StepContext {
        context_with(store, RetryPolicy::new(3, "500ms", Backoff::Exponential).unwrap())
    }

    fn context_with(store: Arc<MemoryStore>, retries: RetryPolicy) -> StepContext {
        let mut events = HashMap::new();
        events.insert(
            "approval".to_string(),
            Schema::object([("approved", Schema::Bool)]),
        );
        StepContext::new(
            store,
            Clock::new(),
            retries,
            ResultSizeLimit::default(),
            Arc::new(events),
            Arc::new(DisabledObservability),
            Arc::new(Mutex::new(Collector::new("wf-1", "test"))),
            Arc::new(LiveShared::new()),
            false,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_executes_once_and_caches() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut step = context(store.clone());
        let calls_in = calls.clone();
        let out: String = step
            .run("greet", || async move {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Ok("Hello".to_string())
            })
            .await
            .unwrap();
        assert_eq!(out, "Hello");

        // Fresh context, same store: cached result, zero invocations.
        let mut step = context(store);
        let calls_in = calls.clone();
        let out: String = step
            .run("greet", || async move {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Ok("other".to_string())
            })
            .await
            .unwrap();
        assert_eq!(out, "Hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_name_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let mut step = context(store);

        let _: String = step.run("fetch-data", || async { Ok("a".into()) }).await.unwrap();
        let err = step
            .run::<_, _, String>("fetch-data", || async { Ok("b".into()) })
            .await
            .unwrap_err();

        match err {
            RunError::Fail(e) => {
                assert!(e.message.contains("Duplicate step name"));
                assert!(e.message.contains("fetch-data"));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_schedules_retry_then_exhausts() {
        let store = Arc::new(MemoryStore::new());

        // Attempt 1 fails: sleep interrupt with wake 500ms out.
        let mut step = context(store.clone());
        let err = step
            .run::<_, _, String>("flaky", || async { anyhow::bail!("boom") })
            .await
            .unwrap_err();
        let wake1 = match err {
            RunError::Suspend(Interrupt::Sleep { wake_at, .. }) => wake_at,
            other => panic!("expected sleep interrupt, got {other:?}"),
        };

        let row = store.get_step("flaky").await.unwrap().unwrap();
        assert_eq!(row.status, StepStatus::Failed);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.retry_history.len(), 1);
        assert_eq!(row.wake_at, Some(wake1));

        // Before wake: cached failed row re-suspends without executing.
        let mut step = context(store.clone());
        let err = step
            .run::<_, _, String>("flaky", || async { panic!("must not run") })
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Suspend(Interrupt::Sleep { .. })));

        // After wake: attempts 2 and 3 fail, exhausting the policy.
        for expected_attempts in [2, 3] {
            tokio::time::advance(std::time::Duration::from_secs(5)).await;
            let mut step = context(store.clone());
            let err = step
                .run::<_, _, String>("flaky", || async { anyhow::bail!("boom") })
                .await
                .unwrap_err();
            let row = store.get_step("flaky").await.unwrap().unwrap();
            assert_eq!(row.attempts, expected_attempts);
            if expected_attempts == 3 {
                match err {
                    RunError::Fail(e) => assert_eq!(e.code, ErrorCode::StepRetryExhausted),
                    other => panic!("expected exhausted, got {other:?}"),
                }
                assert_eq!(row.wake_at, None);
            } else {
                assert!(matches!(err, RunError::Suspend(Interrupt::Sleep { .. })));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_short_circuits() {
        let store = Arc::new(MemoryStore::new());
        let mut step = context(store.clone());

        let err = step
            .run::<_, _, String>("strict", || async {
                Err(non_retriable(anyhow::anyhow!("bad input")))
            })
            .await
            .unwrap_err();

        match err {
            RunError::Fail(e) => {
                assert_eq!(e.code, ErrorCode::StepRetryExhausted);
                assert!(e.message.contains("bad input"));
            }
            other => panic!("expected Fail, got {other:?}"),
        }

        let row = store.get_step("strict").await.unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.status, StepStatus::Failed);
        assert_eq!(row.wake_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_recovery_marks_lost_attempt() {
        let store = Arc::new(MemoryStore::new());

        // Simulate a crash: a running row left behind by a dead process.
        let mut row = StepRow::new("second", StepType::Do, StepStatus::Running);
        row.attempts = 1;
        row.started_at = Some(0);
        store.upsert_step(&row).await.unwrap();

        let mut step = context(store.clone());
        let err = step
            .run::<_, _, String>("second", || async { panic!("must not run") })
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Suspend(Interrupt::Sleep { .. })));

        let row = store.get_step("second").await.unwrap().unwrap();
        assert_eq!(row.status, StepStatus::Failed);
        assert_eq!(row.attempts, 1);
        assert!(row.retry_history[0].error.contains("Loss of isolate"));

        // Once the retry is due, the body executes again.
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        let mut step = context(store.clone());
        let out: String = step.run("second", || async { Ok("done".into()) }).await.unwrap();
        assert_eq!(out, "done");
        assert_eq!(
            store.get_step("second").await.unwrap().unwrap().attempts,
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_inserts_then_resuspends() {
        let store = Arc::new(MemoryStore::new());

        let mut step = context(store.clone());
        let err = step.sleep("pause", "5s").await.unwrap_err();
        let wake = match err {
            RunError::Suspend(Interrupt::Sleep { wake_at, .. }) => wake_at,
            other => panic!("expected sleep, got {other:?}"),
        };

        let row = store.get_step("pause").await.unwrap().unwrap();
        assert_eq!(row.step_type, StepType::Sleep);
        assert_eq!(row.status, StepStatus::Sleeping);
        assert_eq!(row.wake_at, Some(wake));

        // Replay before the alarm promoted it: same interrupt again.
        let mut step = context(store.clone());
        let err = step.sleep("pause", "5s").await.unwrap_err();
        assert!(matches!(err, RunError::Suspend(Interrupt::Sleep { .. })));

        // Promoted rows return immediately.
        let mut promoted = store.get_step("pause").await.unwrap().unwrap();
        promoted.status = StepStatus::Completed;
        store.upsert_step(&promoted).await.unwrap();
        let mut step = context(store);
        assert!(step.sleep("pause", "5s").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_records_type() {
        let store = Arc::new(MemoryStore::new());
        let mut step = context(store.clone());

        let until = Utc::now() + chrono::Duration::hours(1);
        let err = step.sleep_until("deadline", until).await.unwrap_err();
        assert!(matches!(err, RunError::Suspend(Interrupt::Sleep { .. })));

        let row = store.get_step("deadline").await.unwrap().unwrap();
        assert_eq!(row.step_type, StepType::SleepUntil);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_event_suspends_and_consumes_buffer() {
        let store = Arc::new(MemoryStore::new());

        // No buffered event: waiting row + interrupt with timeout.
        let mut step = context(store.clone());
        let err = step
            .wait_for_event_within::<Value>("approval", "1m")
            .await
            .unwrap_err();
        match err {
            RunError::Suspend(Interrupt::Wait { timeout_at, .. }) => {
                assert!(timeout_at.is_some())
            }
            other => panic!("expected wait, got {other:?}"),
        }

        // Buffered event on a fresh instance resolves in the same pass.
        let store = Arc::new(MemoryStore::new());
        store
            .buffer_event("approval", &json!({ "approved": true }), 1)
            .await
            .unwrap();
        let mut step = context(store.clone());
        let payload: Value = step.wait_for_event("approval").await.unwrap();
        assert_eq!(payload, json!({ "approved": true }));

        // Buffer entry is consumed.
        assert!(store.take_event("approval").await.unwrap().is_none());
        let row = store.get_step("approval").await.unwrap().unwrap();
        assert_eq!(row.status, StepStatus::Completed);
        assert_eq!(row.step_type, StepType::WaitForEvent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_resurrects_timeout_error() {
        let store = Arc::new(MemoryStore::new());
        let mut row = StepRow::new("approval", StepType::WaitForEvent, StepStatus::Failed);
        row.error = Some(EngineError::event_timeout("approval").to_envelope());
        store.upsert_step(&row).await.unwrap();

        let mut step = context(store);
        let err = step.wait_for_event::<Value>("approval").await.unwrap_err();
        match err {
            RunError::Fail(e) => assert_eq!(e.code, ErrorCode::EventTimeout),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_size_budget_counts_cached_results() {
        let store = Arc::new(MemoryStore::new());
        let limit = ResultSizeLimit::new("1kb", OverflowPolicy::Fail).unwrap();
        let payload = "x".repeat(600);

        let mut step = context(store.clone());
        step.limit = limit.clone();
        let first: String = {
            let payload = payload.clone();
            step.run("a", || async move { Ok(payload) }).await.unwrap()
        };
        assert_eq!(first.len(), 600);

        // Second step in the same cycle overflows the budget.
        let err = {
            let payload = payload.clone();
            step.run::<_, _, String>("b", || async move { Ok(payload) })
                .await
                .unwrap_err()
        };
        match err {
            RunError::Fail(e) => {
                assert_eq!(e.code, ErrorCode::StepRetryExhausted);
                assert!(e.message.contains("result size limit"));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
        let row = store.get_step("b").await.unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.status, StepStatus::Failed);

        // On replay the cached result of "a" still counts against the budget.
        let mut step = context(store.clone());
        step.limit = limit;
        let _: String = step.run("a", || async { unreachable!() }).await.unwrap();
        assert!(step.result_bytes() > 600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_execution_exits_replay_mode() {
        let store = Arc::new(MemoryStore::new());
        let mut step = context(store.clone());
        // Mirror the runner: replay mode on until a step actually executes.
        let live = step.live.clone();
        live.set_replay(true);

        let _: i32 = step.run("first", || async { Ok(1) }).await.unwrap();
        assert!(!live.is_replay());

        // Cached replays never flip the flag.
        let mut step = context(store);
        let live = step.live.clone();
        live.set_replay(true);
        let _: i32 = step.run("first", || async { unreachable!() }).await.unwrap();
        assert!(live.is_replay());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_context_interrupts() {
        let store = Arc::new(MemoryStore::new());
        let mut step = context(store);
        step.paused = true;

        let err = step
            .run::<_, _, i32>("anything", || async { Ok(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Suspend(Interrupt::Pause)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_override_merges() {
        let store = Arc::new(MemoryStore::new());
        let mut step = context(store.clone());

        let err = step
            .run_with::<_, _, String>(
                "once",
                StepOptions::retries(RetryOverride::default().limit(1)),
                || async { anyhow::bail!("no second chances") },
            )
            .await
            .unwrap_err();

        match err {
            RunError::Fail(e) => assert_eq!(e.code, ErrorCode::StepRetryExhausted),
            other => panic!("expected Fail, got {other:?}"),
        }
    }
}
