use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::callback::MsgCallback;
use super::context::{PackProcessingContext, PackResult};
use super::strategy::{ProcessingDecision, ProcessingStrategy};
use super::submit::{Lane, SubmitStrategy};
use crate::broker::QueueConsumer;
use crate::consumer::MsgPackProcessor;
use crate::discovery::{QueueConfig, QueueKey};
use crate::error::QueueResult;
use crate::metrics::{ConsumerStats, SharedMetrics};
use crate::metrics_const::{
    CONSUMER_COMMITS_COUNTER, PACK_MESSAGES_FAILED_COUNTER, PACK_MESSAGES_SUCCEEDED_COUNTER,
    PACK_MESSAGES_TIMED_OUT_COUNTER, PACK_MESSAGES_TOTAL_COUNTER,
    PACK_PROCESSING_DURATION_HISTOGRAM, PACK_RETRIES_COUNTER, PACK_SIZE_HISTOGRAM,
};
use crate::msg::{QueueMsg, QueuePayload};

/// Business logic for a single message.
///
/// The handler must eventually call exactly one of `on_success` /
/// `on_failure` on `callback`, possibly after returning. Returning an error
/// counts as `on_failure`.
#[async_trait]
pub trait MsgHandler<T>: Send + Sync {
    async fn handle(
        &self,
        msg: Arc<QueueMsg<T>>,
        callback: Arc<dyn MsgCallback>,
        cancel: CancellationToken,
    ) -> QueueResult<()>;
}

/// Shared, bounded pool for per-message handler dispatch.
#[derive(Clone)]
pub struct DispatchPool {
    permits: Arc<Semaphore>,
}

impl DispatchPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub fn spawn<F>(&self, task: F) -> Dispatched
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let release = CancellationToken::new();
        let released = release.clone();
        let handle = tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = released.cancelled() => return,
            };
            tokio::pin!(task);
            let finished = tokio::select! {
                () = &mut task => true,
                _ = released.cancelled() => false,
            };
            drop(permit);
            if !finished {
                task.await;
            }
        });
        Dispatched { handle, release }
    }
}

/// A handler call submitted to a `DispatchPool`.
pub struct Dispatched {
    handle: JoinHandle<()>,
    release: CancellationToken,
}

impl Dispatched {
    /// Stops the call and frees its pool slot.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Frees the pool slot. A call that already started keeps running
    /// outside the pool, one that did not start never will.
    pub fn detach(&self) {
        self.release.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub enum PackOutcome<T> {
    /// The pack resolved (possibly after retries) and should be committed.
    Completed { result: PackResult<T>, attempts: u32 },
    /// The consumer was stopped mid-pack; offsets must not be committed.
    Cancelled,
}

/// Runs a polled pack through the handler under the queue's deadline and
/// processing strategy, then commits.
pub struct PackProcessor<T> {
    key: QueueKey,
    label: String,
    handler: Arc<dyn MsgHandler<T>>,
    pool: DispatchPool,
    metrics: SharedMetrics,
    stats: Arc<ConsumerStats>,
}

impl<T: QueuePayload> PackProcessor<T> {
    pub fn new(
        key: QueueKey,
        handler: Arc<dyn MsgHandler<T>>,
        pool: DispatchPool,
        metrics: SharedMetrics,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            label: key.to_string(),
            key,
            handler,
            pool,
            metrics,
            stats,
        }
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    fn dispatch(
        &self,
        ctx: &Arc<PackProcessingContext<T>>,
        id: Uuid,
        msg: Arc<QueueMsg<T>>,
    ) -> Dispatched {
        let handler = Arc::clone(&self.handler);
        let callback = ctx.callback(id);
        let cancel = ctx.cancellation();
        self.pool.spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = handler.handle(msg, Arc::clone(&callback), cancel).await {
                callback.on_failure(e);
            }
        })
    }

    /// Hands the lanes to the pool, each wave once the previous wave of its
    /// lane resolved.
    async fn submit(
        &self,
        ctx: &Arc<PackProcessingContext<T>>,
        lanes: Vec<Lane<T>>,
        dispatched: &Mutex<Vec<Dispatched>>,
    ) {
        join_all(lanes.into_iter().map(move |lane| async move {
            let mut waves = lane.into_iter().peekable();
            while let Some(wave) = waves.next() {
                let ids: Vec<Uuid> = wave.iter().map(|(id, _)| *id).collect();
                let calls: Vec<Dispatched> = wave
                    .into_iter()
                    .map(|(id, msg)| self.dispatch(ctx, id, msg))
                    .collect();
                lock(dispatched).extend(calls);
                if waves.peek().is_some() {
                    ctx.await_resolved(&ids).await;
                }
            }
        }))
        .await;
    }

    fn record(&self, result: &PackResult<T>) {
        let labels = [("queue", self.label.clone())];
        let as_u64 = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        self.metrics
            .increment(PACK_MESSAGES_TOTAL_COUNTER, &labels, as_u64(result.total()));
        self.metrics.increment(
            PACK_MESSAGES_SUCCEEDED_COUNTER,
            &labels,
            as_u64(result.succeeded.len()),
        );
        self.metrics
            .increment(PACK_MESSAGES_FAILED_COUNTER, &labels, as_u64(result.failed.len()));
        self.metrics.increment(
            PACK_MESSAGES_TIMED_OUT_COUNTER,
            &labels,
            as_u64(result.timed_out.len()),
        );

        self.stats.record_iteration(
            result.succeeded.len(),
            result.failed.len(),
            result.timed_out.len(),
        );
        for (tenant, error) in &result.exceptions {
            self.stats.record_exception(*tenant, error);
        }
    }

    /// Dispatches every message, waits for the pack, and applies the
    /// processing strategy until it decides to commit.
    pub async fn run(
        &self,
        msgs: Vec<QueueMsg<T>>,
        config: &QueueConfig,
        cancel: &CancellationToken,
    ) -> PackOutcome<T> {
        let start = Instant::now();
        let labels = [("queue", self.label.clone())];
        self.metrics
            .histogram(PACK_SIZE_HISTOGRAM, &labels, msgs.len() as f64);

        let mut strategy = ProcessingStrategy::new(self.label.clone(), &config.processing_strategy);
        let submit_strategy = SubmitStrategy::new(&config.submit_strategy);
        let mut batch: Vec<(Uuid, Arc<QueueMsg<T>>)> = msgs
            .into_iter()
            .map(|m| (Uuid::new_v4(), Arc::new(m)))
            .collect();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let ctx = Arc::new(
                PackProcessingContext::new(
                    self.label.clone(),
                    batch.iter().cloned(),
                    cancel.child_token(),
                )
                .with_skip_timed_out(strategy.skip_timed_out()),
            );
            let dispatched = Mutex::new(Vec::new());

            let submitting = self.submit(&ctx, submit_strategy.plan(&batch), &dispatched);
            tokio::pin!(submitting);
            let waiting = ctx.await_completion(config.pack_processing_timeout);
            tokio::pin!(waiting);
            let mut submitted = false;
            let completed = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        ctx.invalidate();
                        ctx.cleanup();
                        for call in lock(&dispatched).iter() {
                            call.abort();
                        }
                        debug!(queue = %self.label, "Pack processing cancelled");
                        return PackOutcome::Cancelled;
                    }
                    completed = &mut waiting => break completed,
                    () = &mut submitting, if !submitted => submitted = true,
                }
            };

            let result = ctx.result(completed);
            if !completed {
                ctx.log_timeouts();
                let outstanding = std::mem::take(&mut *lock(&dispatched));
                let outstanding = outstanding.iter().filter(|call| !call.is_finished());
                if strategy.skip_timed_out() {
                    outstanding.for_each(Dispatched::abort);
                } else {
                    outstanding.for_each(Dispatched::detach);
                }
            }
            ctx.log_failures();
            ctx.cleanup();
            self.record(&result);

            match strategy.analyze(&result) {
                ProcessingDecision::Commit => {
                    self.metrics.histogram(
                        PACK_PROCESSING_DURATION_HISTOGRAM,
                        &labels,
                        start.elapsed().as_secs_f64(),
                    );
                    return PackOutcome::Completed { result, attempts };
                }
                ProcessingDecision::Reprocess { messages, pause } => {
                    self.metrics.increment(PACK_RETRIES_COUNTER, &labels, 1);
                    if !pause.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return PackOutcome::Cancelled,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                    let retried: HashSet<Uuid> = messages.iter().map(|(id, _)| *id).collect();
                    batch.retain(|(id, _)| retried.contains(id));
                }
            }
        }
    }
}

#[async_trait]
impl<T: QueuePayload> MsgPackProcessor<T> for PackProcessor<T> {
    async fn process(
        &self,
        msgs: Vec<QueueMsg<T>>,
        consumer: &dyn QueueConsumer<T>,
        config: &QueueConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self.run(msgs, config, cancel).await {
            PackOutcome::Cancelled => Ok(()),
            PackOutcome::Completed { .. } => {
                consumer
                    .commit()
                    .with_context(|| format!("Failed to commit offsets for {}", self.label))?;
                self.metrics.increment(
                    CONSUMER_COMMITS_COUNTER,
                    &[("queue", self.label.clone())],
                    1,
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{
        EntityId, ProcessingStrategyType, ServiceType, SubmitStrategyType, TenantId,
    };
    use crate::error::QueueError;
    use crate::metrics::InMemoryMetricsSink;
    use crate::msg::{TbMsg, ToRuleEngineMsg};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Succeeds unless the message type is "FAIL"; "HANG" never calls back.
    struct TypeHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MsgHandler<ToRuleEngineMsg> for TypeHandler {
        async fn handle(
            &self,
            msg: Arc<QueueMsg<ToRuleEngineMsg>>,
            callback: Arc<dyn MsgCallback>,
            _cancel: CancellationToken,
        ) -> QueueResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let msg_type = msg
                .value
                .tb_msg
                .as_ref()
                .map(|m| m.msg_type.clone())
                .unwrap_or_default();
            match msg_type.as_str() {
                "FAIL" => Err(QueueError::handler("bad payload")),
                "HANG" => Ok(()),
                _ => {
                    callback.on_success();
                    Ok(())
                }
            }
        }
    }

    fn message(msg_type: &str) -> QueueMsg<ToRuleEngineMsg> {
        let tb_msg = TbMsg::new(TenantId::SYS, msg_type, EntityId::device(Uuid::new_v4()));
        QueueMsg::new(Uuid::new_v4(), ToRuleEngineMsg::new(tb_msg))
    }

    /// The first call never completes, later calls succeed.
    #[derive(Default)]
    struct HangOnceHandler {
        calls: AtomicUsize,
        hung: Mutex<Option<Arc<dyn MsgCallback>>>,
    }

    #[async_trait]
    impl MsgHandler<ToRuleEngineMsg> for HangOnceHandler {
        async fn handle(
            &self,
            _msg: Arc<QueueMsg<ToRuleEngineMsg>>,
            callback: Arc<dyn MsgCallback>,
            _cancel: CancellationToken,
        ) -> QueueResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                *self.hung.lock().unwrap() = Some(callback.clone());
                std::future::pending::<()>().await;
            }
            callback.on_success();
            Ok(())
        }
    }

    /// Records the order of calls and how many ran at once.
    #[derive(Default)]
    struct SlowHandler {
        order: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl MsgHandler<ToRuleEngineMsg> for SlowHandler {
        async fn handle(
            &self,
            msg: Arc<QueueMsg<ToRuleEngineMsg>>,
            callback: Arc<dyn MsgCallback>,
            _cancel: CancellationToken,
        ) -> QueueResult<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(tb_msg) = &msg.value.tb_msg {
                self.order.lock().unwrap().push(tb_msg.msg_type.clone());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            callback.on_success();
            Ok(())
        }
    }

    fn processor(handler: Arc<TypeHandler>) -> PackProcessor<ToRuleEngineMsg> {
        processor_with(handler, 4)
    }

    fn processor_with(
        handler: Arc<dyn MsgHandler<ToRuleEngineMsg>>,
        pool_size: usize,
    ) -> PackProcessor<ToRuleEngineMsg> {
        let key = QueueKey::new(ServiceType::RuleEngine);
        PackProcessor::new(
            key.clone(),
            handler,
            DispatchPool::new(pool_size),
            Arc::new(InMemoryMetricsSink::new()),
            Arc::new(ConsumerStats::new(key)),
        )
    }

    fn queue(strategy_type: ProcessingStrategyType) -> QueueConfig {
        let mut config = QueueConfig::new(ServiceType::RuleEngine, "Main", "tb_rule_engine.main");
        config.pack_processing_timeout = Duration::from_millis(100);
        config.processing_strategy.strategy_type = strategy_type;
        config.processing_strategy.retries = 2;
        config.processing_strategy.pause_between_retries = Duration::ZERO;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_strategy_completes_after_single_attempt() {
        let handler = Arc::new(TypeHandler {
            calls: AtomicUsize::new(0),
        });
        let processor = processor(Arc::clone(&handler));
        let msgs = vec![message("OK"), message("FAIL"), message("HANG")];

        let outcome = processor
            .run(msgs, &queue(ProcessingStrategyType::SkipAllFailures), &CancellationToken::new())
            .await;
        match outcome {
            PackOutcome::Completed { result, attempts } => {
                assert_eq!(attempts, 1);
                assert!(!result.completed);
                assert_eq!(result.succeeded.len(), 1);
                assert_eq!(result.failed.len(), 1);
                assert_eq!(result.timed_out.len(), 1);
            }
            PackOutcome::Cancelled => panic!("not cancelled"),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed_resubmits_only_failures() {
        let handler = Arc::new(TypeHandler {
            calls: AtomicUsize::new(0),
        });
        let processor = processor(Arc::clone(&handler));
        let msgs = vec![message("OK"), message("FAIL")];

        let outcome = processor
            .run(msgs, &queue(ProcessingStrategyType::RetryFailed), &CancellationToken::new())
            .await;
        match outcome {
            PackOutcome::Completed { attempts, result } => {
                // first pass + 2 retries, then the budget is spent
                assert_eq!(attempts, 3);
                assert_eq!(result.failed.len(), 1);
            }
            PackOutcome::Cancelled => panic!("not cancelled"),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pack_is_not_completed() {
        let handler = Arc::new(TypeHandler {
            calls: AtomicUsize::new(0),
        });
        let processor = processor(handler);
        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cancel.cancel();
            })
        };

        let outcome = processor
            .run(
                vec![message("HANG")],
                &queue(ProcessingStrategyType::SkipAllFailures),
                &cancel,
            )
            .await;
        assert!(matches!(outcome, PackOutcome::Cancelled));
        stopper.await.unwrap();
    }

    #[rstest]
    #[case::keep_running(ProcessingStrategyType::SkipAllFailures, true)]
    #[case::abandon(ProcessingStrategyType::SkipAllFailuresAndTimedOut, false)]
    #[tokio::test(start_paused = true)]
    async fn test_hung_handler_does_not_starve_later_packs(
        #[case] strategy_type: ProcessingStrategyType,
        #[case] hung_callback_valid: bool,
    ) {
        let handler = Arc::new(HangOnceHandler::default());
        let processor = processor_with(handler.clone(), 1);
        let config = queue(strategy_type);
        let cancel = CancellationToken::new();

        let mut timed_out = Vec::new();
        for i in 0..3 {
            match processor.run(vec![message(&format!("MSG_{i}"))], &config, &cancel).await {
                PackOutcome::Completed { result, .. } => {
                    timed_out.push(result.timed_out.len());
                    assert_eq!(result.completed, i > 0, "pack {i}");
                }
                PackOutcome::Cancelled => panic!("not cancelled"),
            }
        }
        assert_eq!(timed_out, vec![1, 0, 0]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let hung = handler.hung.lock().unwrap().clone().unwrap();
        assert_eq!(hung.is_msg_valid(), hung_callback_valid);
    }

    #[rstest]
    #[case::burst(SubmitStrategyType::Burst, 1, 4)]
    #[case::batch(SubmitStrategyType::Batch, 3, 3)]
    #[case::sequential(SubmitStrategyType::Sequential, 1, 1)]
    #[tokio::test(start_paused = true)]
    async fn test_submit_strategy_bounds_concurrency_and_keeps_order(
        #[case] strategy_type: SubmitStrategyType,
        #[case] batch_size: usize,
        #[case] expected_peak: usize,
    ) {
        let handler = Arc::new(SlowHandler::default());
        let processor = processor_with(handler.clone(), 8);
        let mut config = queue(ProcessingStrategyType::SkipAllFailures);
        config.pack_processing_timeout = Duration::from_secs(1);
        config.submit_strategy.strategy_type = strategy_type;
        config.submit_strategy.batch_size = batch_size;
        let types: Vec<String> = (0..4).map(|i| format!("MSG_{i}")).collect();

        let outcome = processor
            .run(
                types.iter().map(|t| message(t)).collect(),
                &config,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, PackOutcome::Completed { ref result, .. } if result.completed));
        assert_eq!(handler.peak.load(Ordering::SeqCst), expected_peak);
        if expected_peak == 1 {
            assert_eq!(*handler.order.lock().unwrap(), types);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_by_originator_serializes_each_entity() {
        let handler = Arc::new(SlowHandler::default());
        let processor = processor_with(handler.clone(), 8);
        let mut config = queue(ProcessingStrategyType::SkipAllFailures);
        config.submit_strategy.strategy_type = SubmitStrategyType::SequentialByOriginator;

        let a = EntityId::device(Uuid::from_u128(1));
        let b = EntityId::device(Uuid::from_u128(2));
        let msgs = [("A_0", a), ("B_0", b), ("A_1", a), ("B_1", b)]
            .into_iter()
            .map(|(t, originator)| {
                let tb_msg = TbMsg::new(TenantId::SYS, t, originator);
                QueueMsg::new(Uuid::new_v4(), ToRuleEngineMsg::new(tb_msg))
            })
            .collect();

        let outcome = processor.run(msgs, &config, &CancellationToken::new()).await;
        assert!(matches!(outcome, PackOutcome::Completed { ref result, .. } if result.completed));
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        let order = handler.order.lock().unwrap().clone();
        let position = |t: &str| order.iter().position(|o| o == t).unwrap();
        assert!(position("A_0") < position("A_1"));
        assert!(position("B_0") < position("B_1"));
    }

    #[tokio::test]
    async fn test_dispatch_pool_bounds_concurrency() {
        let pool = DispatchPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for call in handles {
            call.handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
