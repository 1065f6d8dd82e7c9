//! Worker pool, unit queue and retry scheduling.
//!
//! The pool never starts more tasks than the target handed to
//! [`WorkerPool::has_capacity`]; the orchestrator asks before every spawn, so
//! lowering the target simply lets in-flight work drain.

use crate::client::Translator;
use crate::document::{FileId, JobDocument, TranslationUnit};
use crate::error::{FailureKind, InferenceError};
use crate::retry::{RetryConfig, UnitState};
use crate::tuner::{Sample, SampleOutcome};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::time::DelayQueue;
use tracing::error;

/// FIFO of units with one lane per open file, served round-robin so one large
/// file cannot starve the others.
#[derive(Debug, Default)]
pub struct UnitQueue {
    lanes: VecDeque<(FileId, VecDeque<TranslationUnit>)>,
    len: usize,
}

impl UnitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: TranslationUnit) {
        self.len += 1;
        match self.lanes.iter_mut().find(|(file, _)| *file == unit.file) {
            Some((_, lane)) => lane.push_back(unit),
            None => self.lanes.push_back((unit.file, VecDeque::from([unit]))),
        }
    }

    pub fn extend(&mut self, units: impl IntoIterator<Item = TranslationUnit>) {
        for unit in units {
            self.push(unit);
        }
    }

    /// Take the next unit from the lane at the front, then rotate that lane to the back.
    pub fn pop(&mut self) -> Option<TranslationUnit> {
        let (file, mut lane) = self.lanes.pop_front()?;
        let unit = lane.pop_front();
        if !lane.is_empty() {
            self.lanes.push_back((file, lane));
        }
        if unit.is_some() {
            self.len -= 1;
        }
        unit
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Units waiting out their backoff delay. They hold no concurrency slot.
pub struct RetryQueue {
    delayed: DelayQueue<TranslationUnit>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self {
            delayed: DelayQueue::new(),
        }
    }

    pub fn schedule(&mut self, unit: TranslationUnit, delay: Duration) {
        self.delayed.insert(unit, delay);
    }

    /// Wait for the next unit whose delay has elapsed. Resolves to `None`
    /// immediately when nothing is scheduled.
    pub async fn next_ready(&mut self) -> Option<TranslationUnit> {
        use futures::StreamExt;
        self.delayed.next().await.map(|expired| expired.into_inner())
    }

    pub fn is_empty(&self) -> bool {
        self.delayed.is_empty()
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// What a worker reports back after one request.
#[derive(Debug)]
pub struct Completion {
    pub unit: TranslationUnit,
    pub latency: Duration,
    pub error: Option<InferenceError>,
}

impl Completion {
    /// Signal fed to the concurrency controller.
    pub fn sample(&self) -> Sample {
        let outcome = match self.error.as_ref().map(InferenceError::kind) {
            None => SampleOutcome::Success,
            Some(FailureKind::RateLimited) => SampleOutcome::RateLimited,
            Some(_) => SampleOutcome::Failure,
        };
        Sample {
            outcome,
            latency: self.latency,
        }
    }
}

pub struct WorkerPool<T: Translator> {
    translator: Arc<T>,
    retry: RetryConfig,
    tasks: JoinSet<Completion>,
    peak: usize,
}

impl<T: Translator> WorkerPool<T> {
    pub fn new(translator: Arc<T>, retry: RetryConfig) -> Self {
        Self {
            translator,
            retry,
            tasks: JoinSet::new(),
            peak: 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Highest number of simultaneously running requests seen so far.
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn has_capacity(&self, target: usize) -> bool {
        self.tasks.len() < target
    }

    pub fn spawn(&mut self, unit: TranslationUnit, document: Arc<Mutex<JobDocument>>) {
        let translator = Arc::clone(&self.translator);
        let retry = self.retry.clone();
        self.tasks
            .spawn(run_unit(translator, retry, document, unit));
        self.peak = self.peak.max(self.tasks.len());
    }

    /// Next finished request, or `None` when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        loop {
            match self.tasks.join_next().await? {
                Ok(completion) => return Some(completion),
                Err(e) => error!("Worker task ended abnormally: {}", e),
            }
        }
    }
}

/// Dispatch one unit: call the translator, merge a success into the owning
/// document, and advance the unit's state.
async fn run_unit<T: Translator>(
    translator: Arc<T>,
    retry: RetryConfig,
    document: Arc<Mutex<JobDocument>>,
    mut unit: TranslationUnit,
) -> Completion {
    let dispatched = std::mem::replace(&mut unit.state, UnitState::Pending).dispatch();
    let started = Instant::now();

    let result = AssertUnwindSafe(translator.translate(
        &unit.source_text,
        &unit.source_language,
        &unit.target_language,
    ))
    .catch_unwind()
    .await
    .unwrap_or_else(|_| Err(InferenceError::Internal("translator panicked".to_string())));
    let latency = started.elapsed();

    let result = result.and_then(|text| {
        let mut doc = document.lock().unwrap_or_else(PoisonError::into_inner);
        if doc.set_slot(unit.record_index, &unit.field, &unit.target_language, text) {
            Ok(())
        } else {
            Err(InferenceError::Internal(format!(
                "slot {} no longer exists in document",
                unit.slot()
            )))
        }
    });

    match result {
        Ok(()) => {
            unit.state = dispatched.succeed();
            Completion {
                unit,
                latency,
                error: None,
            }
        }
        Err(e) => {
            unit.state = dispatched.fail(&e, &retry);
            Completion {
                unit,
                latency,
                error: Some(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unit(file: FileId, n: usize) -> TranslationUnit {
        TranslationUnit {
            file,
            record_index: 0,
            record_id: format!("r{}", n),
            field: "name".to_string(),
            source_language: "de".to_string(),
            source_text: "Tisch".to_string(),
            target_language: "en".to_string(),
            state: UnitState::Pending,
        }
    }

    fn document() -> Arc<Mutex<JobDocument>> {
        let records = json!([{"name": {"de": "Tisch", "en": null}}]);
        Arc::new(Mutex::new(JobDocument::new(
            records.as_array().cloned().unwrap(),
        )))
    }

    struct Fixed(Result<&'static str, fn() -> InferenceError>);

    impl Translator for Fixed {
        async fn translate(&self, _: &str, _: &str, _: &str) -> Result<String, InferenceError> {
            match &self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(make) => Err(make()),
            }
        }
    }

    struct Panicky;

    impl Translator for Panicky {
        async fn translate(&self, _: &str, _: &str, _: &str) -> Result<String, InferenceError> {
            panic!("boom")
        }
    }

    // ==================== UnitQueue Tests ====================

    #[test]
    fn test_queue_round_robins_across_files() {
        let mut queue = UnitQueue::new();
        queue.extend((0..3).map(|n| unit(0, n)));
        queue.extend((0..2).map(|n| unit(1, n)));
        queue.push(unit(2, 0));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|u| (u.file, u.record_id))
            .collect();
        assert_eq!(
            order,
            vec![
                (0, "r0".to_string()),
                (1, "r0".to_string()),
                (2, "r0".to_string()),
                (0, "r1".to_string()),
                (1, "r1".to_string()),
                (0, "r2".to_string()),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_len_tracks_push_and_pop() {
        let mut queue = UnitQueue::new();
        assert!(queue.pop().is_none());
        queue.push(unit(0, 0));
        queue.push(unit(0, 1));
        assert_eq!(queue.len(), 2);
        queue.pop();
        assert_eq!(queue.len(), 1);
    }

    // ==================== RetryQueue Tests ====================

    #[tokio::test]
    async fn test_retry_queue_releases_after_delay() {
        let mut retries = RetryQueue::new();
        retries.schedule(unit(0, 1), Duration::from_millis(30));
        retries.schedule(unit(0, 0), Duration::from_millis(5));

        let first = retries.next_ready().await.unwrap();
        let second = retries.next_ready().await.unwrap();
        assert_eq!(first.record_id, "r0");
        assert_eq!(second.record_id, "r1");
        assert!(retries.is_empty());
        assert!(retries.next_ready().await.is_none());
    }

    // ==================== Worker Tests ====================

    #[tokio::test]
    async fn test_worker_merges_success_into_document() {
        let doc = document();
        let mut pool = WorkerPool::new(Arc::new(Fixed(Ok("Table"))), RetryConfig::default());
        pool.spawn(unit(0, 0), Arc::clone(&doc));

        let completion = pool.next_completion().await.unwrap();
        assert!(completion.error.is_none());
        assert_eq!(completion.unit.state, UnitState::Succeeded { attempts: 1 });
        assert_eq!(completion.sample().outcome, SampleOutcome::Success);
        assert_eq!(doc.lock().unwrap().records()[0]["name"]["en"], "Table");
        assert!(pool.next_completion().await.is_none());
    }

    #[tokio::test]
    async fn test_worker_schedules_retry_on_transient_error() {
        let doc = document();
        let policy = RetryConfig::new(3, Duration::from_millis(10)).with_jitter(false);
        let mut pool = WorkerPool::new(Arc::new(Fixed(Err(|| InferenceError::RateLimited))), policy);
        pool.spawn(unit(0, 0), Arc::clone(&doc));

        let completion = pool.next_completion().await.unwrap();
        assert_eq!(
            completion.unit.state,
            UnitState::Retrying {
                attempt: 1,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(completion.sample().outcome, SampleOutcome::RateLimited);
        assert!(doc.lock().unwrap().records()[0]["name"]["en"].is_null());
    }

    #[tokio::test]
    async fn test_worker_fails_terminal_error() {
        let mut pool = WorkerPool::new(
            Arc::new(Fixed(Err(|| InferenceError::Malformed("x".to_string())))),
            RetryConfig::default(),
        );
        pool.spawn(unit(0, 0), document());

        let completion = pool.next_completion().await.unwrap();
        assert!(matches!(completion.unit.state, UnitState::Failed { attempts: 1, .. }));
        assert_eq!(completion.sample().outcome, SampleOutcome::Failure);
    }

    #[tokio::test]
    async fn test_worker_reports_vanished_slot() {
        let mut pool = WorkerPool::new(Arc::new(Fixed(Ok("Table"))), RetryConfig::default());
        let mut missing = unit(0, 0);
        missing.field = "title".to_string();
        pool.spawn(missing, document());

        let completion = pool.next_completion().await.unwrap();
        assert!(matches!(completion.error, Some(InferenceError::Internal(_))));
        assert!(completion.unit.state.is_terminal());
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_terminal_failure() {
        let mut pool = WorkerPool::new(Arc::new(Panicky), RetryConfig::default());
        pool.spawn(unit(0, 0), document());

        let completion = pool.next_completion().await.unwrap();
        assert!(matches!(completion.unit.state, UnitState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_pool_tracks_in_flight_and_peak() {
        struct Slow(Arc<AtomicUsize>);

        impl Translator for Slow {
            async fn translate(&self, _: &str, _: &str, _: &str) -> Result<String, InferenceError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok("x".to_string())
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(Arc::new(Slow(Arc::clone(&calls))), RetryConfig::default());
        let doc = document();
        for n in 0..3 {
            assert!(pool.has_capacity(3));
            pool.spawn(unit(0, n), Arc::clone(&doc));
        }
        assert!(!pool.has_capacity(3));
        assert_eq!(pool.in_flight(), 3);

        while pool.next_completion().await.is_some() {}
        assert_eq!(pool.peak(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
