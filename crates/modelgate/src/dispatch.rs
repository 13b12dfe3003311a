use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::GatewayError;

/// Supervisor sampling period.
pub const SCALE_TICK: Duration = Duration::from_millis(100);
/// Consecutive low-utilization ticks before one worker is retired.
const SCALE_DOWN_TICKS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct DispatcherConfig {
	pub min_workers: usize,
	pub max_workers: usize,
	pub max_queued_requests: usize,
	/// Queue utilization (len/cap) at or above which workers are spawned.
	pub scale_up_threshold: f64,
	/// Utilization at or below which idle workers are retired, after hysteresis.
	pub scale_down_threshold: f64,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			min_workers: 2,
			max_workers: 16,
			max_queued_requests: 128,
			scale_up_threshold: 0.75,
			scale_down_threshold: 0.25,
		}
	}
}

impl DispatcherConfig {
	pub fn validate(&self) -> Result<(), String> {
		if self.max_workers == 0 || self.max_workers < self.min_workers {
			return Err("max_workers must be >= min_workers and > 0".to_string());
		}
		if self.max_queued_requests == 0 {
			return Err("max_queued_requests must be > 0".to_string());
		}
		if !(0.0..=1.0).contains(&self.scale_up_threshold)
			|| !(0.0..=1.0).contains(&self.scale_down_threshold)
			|| self.scale_down_threshold > self.scale_up_threshold
		{
			return Err("scale thresholds must satisfy 0 <= down <= up <= 1".to_string());
		}
		Ok(())
	}
}

/// A queued unit of work: given its cancellation token, produce the result
/// future. The token is a child of the submitter's context.
pub type Job<R> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, R> + Send>;

enum ItemResult<R> {
	Completed(R),
	Cancelled,
}

struct WorkItem<R> {
	job: Job<R>,
	token: CancellationToken,
	done: oneshot::Sender<ItemResult<R>>,
	submitted_at: Instant,
}

/// Handle to one submitted item. Dropping it does not cancel the work;
/// call [`ResultHandle::cancel`] for that.
pub struct ResultHandle<R> {
	rx: oneshot::Receiver<ItemResult<R>>,
	token: CancellationToken,
}

impl<R> ResultHandle<R> {
	pub fn cancel(&self) {
		self.token.cancel();
	}

	/// Wait for the item to complete or be cancelled. The submitter's
	/// context token cancels the item transitively, so a separate ctx
	/// argument is unnecessary here.
	pub async fn join(self) -> Result<R, GatewayError> {
		match self.rx.await {
			Ok(ItemResult::Completed(r)) => Ok(r),
			Ok(ItemResult::Cancelled) => Err(GatewayError::Cancelled),
			// Worker dropped the sender: forced shutdown.
			Err(_) => Err(GatewayError::Cancelled),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherStats {
	pub workers: usize,
	pub queued: usize,
	pub capacity: usize,
}

struct Shared<R> {
	cfg: DispatcherConfig,
	tx: parking_lot::Mutex<Option<mpsc::Sender<WorkItem<R>>>>,
	rx: Mutex<mpsc::Receiver<WorkItem<R>>>,
	retire_tx: mpsc::Sender<()>,
	retire_rx: Mutex<mpsc::Receiver<()>>,
	queue_depth: AtomicUsize,
	workers: AtomicUsize,
	/// Set when shutdown begins; submissions are refused from then on.
	shutdown: CancellationToken,
	/// Set when the grace period expires; aborts in-flight items.
	force: CancellationToken,
	tracker: TaskTracker,
}

/// Bounded-queue worker pool, elastic between `min_workers` and
/// `max_workers`. FIFO by submission; each item runs at most once, on
/// exactly one worker. The queue is the sole admission-control point:
/// a full queue rejects synchronously, it never blocks the caller.
pub struct Dispatcher<R: Send + 'static> {
	shared: Arc<Shared<R>>,
}

impl<R: Send + 'static> Dispatcher<R> {
	pub fn new(cfg: DispatcherConfig) -> Result<Self, GatewayError> {
		cfg.validate().map_err(GatewayError::Internal)?;
		let (tx, rx) = mpsc::channel(cfg.max_queued_requests);
		let (retire_tx, retire_rx) = mpsc::channel(cfg.max_workers.max(1));
		let shared = Arc::new(Shared {
			cfg,
			tx: parking_lot::Mutex::new(Some(tx)),
			rx: Mutex::new(rx),
			retire_tx,
			retire_rx: Mutex::new(retire_rx),
			queue_depth: AtomicUsize::new(0),
			workers: AtomicUsize::new(0),
			shutdown: CancellationToken::new(),
			force: CancellationToken::new(),
			tracker: TaskTracker::new(),
		});
		for _ in 0..shared.cfg.min_workers {
			spawn_worker(&shared);
		}
		tokio::spawn(supervise(shared.clone()));
		Ok(Dispatcher { shared })
	}

	/// Non-blocking enqueue. An accepted item will either run to completion
	/// or end cancelled; it is never silently dropped.
	pub fn submit(
		&self,
		ctx: &CancellationToken,
		job: Job<R>,
	) -> Result<ResultHandle<R>, GatewayError> {
		if self.shared.shutdown.is_cancelled() {
			return Err(GatewayError::QueueFull);
		}
		if ctx.is_cancelled() {
			return Err(GatewayError::Cancelled);
		}
		let token = ctx.child_token();
		let (done_tx, done_rx) = oneshot::channel();
		let item = WorkItem {
			job,
			token: token.clone(),
			done: done_tx,
			submitted_at: Instant::now(),
		};
		let guard = self.shared.tx.lock();
		let Some(tx) = guard.as_ref() else {
			return Err(GatewayError::QueueFull);
		};
		match tx.try_send(item) {
			Ok(()) => {
				self.shared.queue_depth.fetch_add(1, Ordering::Relaxed);
				Ok(ResultHandle { rx: done_rx, token })
			},
			Err(_) => Err(GatewayError::QueueFull),
		}
	}

	pub fn stats(&self) -> DispatcherStats {
		DispatcherStats {
			workers: self.shared.workers.load(Ordering::Relaxed),
			queued: self.shared.queue_depth.load(Ordering::Relaxed),
			capacity: self.shared.cfg.max_queued_requests,
		}
	}

	/// Refuse new submissions, wait up to `grace` for queued and running
	/// items, then force-cancel whatever remains.
	pub async fn shutdown(&self, grace: Duration) {
		self.shared.shutdown.cancel();
		// Closing the queue lets workers drain it and exit.
		self.shared.tx.lock().take();
		self.shared.tracker.close();
		if tokio::time::timeout(grace, self.shared.tracker.wait())
			.await
			.is_err()
		{
			self.shared.force.cancel();
			self.shared.tracker.wait().await;
		}
	}
}

fn spawn_worker<R: Send + 'static>(shared: &Arc<Shared<R>>) {
	shared.workers.fetch_add(1, Ordering::AcqRel);
	let shared = shared.clone();
	shared.tracker.clone().spawn(worker_loop(shared));
}

async fn worker_loop<R: Send + 'static>(shared: Arc<Shared<R>>) {
	enum Next<R> {
		Item(WorkItem<R>),
		Retire,
		Closed,
	}
	loop {
		let next = tokio::select! {
			biased;
			item = async { shared.rx.lock().await.recv().await } => match item {
				Some(item) => Next::Item(item),
				None => Next::Closed,
			},
			_ = async { shared.retire_rx.lock().await.recv().await } => Next::Retire,
		};
		match next {
			Next::Item(item) => {
				shared.queue_depth.fetch_sub(1, Ordering::Relaxed);
				run_item(&shared, item).await;
			},
			Next::Retire => {
				// Retire only while idle and only above the floor; the counter
				// update decides races between concurrently retiring workers.
				let retired = shared
					.workers
					.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
						(w > shared.cfg.min_workers).then(|| w - 1)
					})
					.is_ok();
				if retired {
					return;
				}
			},
			Next::Closed => break,
		}
	}
	shared.workers.fetch_sub(1, Ordering::AcqRel);
}

async fn run_item<R>(shared: &Shared<R>, item: WorkItem<R>) {
	if item.token.is_cancelled() {
		let _ = item.done.send(ItemResult::Cancelled);
		return;
	}
	let queue_wait = item.submitted_at.elapsed();
	if queue_wait > Duration::from_secs(1) {
		debug!(?queue_wait, "work item waited in queue");
	}
	let fut = (item.job)(item.token.clone());
	tokio::select! {
		result = fut => {
			let _ = item.done.send(ItemResult::Completed(result));
		},
		// Dropping the job future aborts its upstream I/O.
		_ = item.token.cancelled() => {
			let _ = item.done.send(ItemResult::Cancelled);
		},
		_ = shared.force.cancelled() => {
			let _ = item.done.send(ItemResult::Cancelled);
		},
	}
}

async fn supervise<R: Send + 'static>(shared: Arc<Shared<R>>) {
	let mut low_ticks = 0u32;
	let mut interval = tokio::time::interval(SCALE_TICK);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	loop {
		tokio::select! {
			_ = interval.tick() => {},
			_ = shared.shutdown.cancelled() => return,
		}
		let cfg = &shared.cfg;
		let queued = shared.queue_depth.load(Ordering::Relaxed);
		let util = queued as f64 / cfg.max_queued_requests as f64;
		let workers = shared.workers.load(Ordering::Relaxed);

		if util >= cfg.scale_up_threshold && workers < cfg.max_workers {
			let headroom = cfg.max_workers - workers;
			let over = (util - cfg.scale_up_threshold) / (1.0 - cfg.scale_up_threshold).max(f64::EPSILON);
			let spawn = ((headroom as f64 * over).ceil() as usize).clamp(1, headroom);
			debug!(util, workers, spawn, "scaling up");
			for _ in 0..spawn {
				spawn_worker(&shared);
			}
			low_ticks = 0;
		} else if util <= cfg.scale_down_threshold {
			low_ticks += 1;
			if low_ticks >= SCALE_DOWN_TICKS && workers > cfg.min_workers {
				// One retirement per trigger; the next window earns the next.
				let _ = shared.retire_tx.try_send(());
				low_ticks = 0;
			}
		} else {
			low_ticks = 0;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicBool;

	use tokio::sync::Semaphore;

	use super::*;

	fn cfg(min: usize, max: usize, cap: usize) -> DispatcherConfig {
		DispatcherConfig {
			min_workers: min,
			max_workers: max,
			max_queued_requests: cap,
			scale_up_threshold: 0.5,
			scale_down_threshold: 0.25,
		}
	}

	fn blocker(sem: Arc<Semaphore>, started: Arc<AtomicUsize>) -> Job<u32> {
		Box::new(move |_token| {
			Box::pin(async move {
				started.fetch_add(1, Ordering::SeqCst);
				let _permit = sem.acquire().await;
				1
			})
		})
	}

	async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		while Instant::now() < deadline {
			if cond() {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		cond()
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn full_queue_rejects_synchronously() {
		let d: Dispatcher<u32> = Dispatcher::new(cfg(1, 1, 2)).unwrap();
		let ctx = CancellationToken::new();
		let sem = Arc::new(Semaphore::new(0));
		let started = Arc::new(AtomicUsize::new(0));

		let running = d
			.submit(&ctx, blocker(sem.clone(), started.clone()))
			.unwrap();
		// Wait for the worker to pull the first item off the queue.
		assert!(wait_for(|| started.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await);

		let q1 = d.submit(&ctx, blocker(sem.clone(), started.clone())).unwrap();
		let q2 = d.submit(&ctx, blocker(sem.clone(), started.clone())).unwrap();

		let before = Instant::now();
		let rejected = d.submit(&ctx, blocker(sem.clone(), started.clone()));
		let elapsed = before.elapsed();
		assert!(matches!(rejected, Err(GatewayError::QueueFull)));
		assert!(elapsed < Duration::from_millis(1), "submit blocked {elapsed:?}");

		sem.add_permits(16);
		assert_eq!(running.join().await.unwrap(), 1);
		assert_eq!(q1.join().await.unwrap(), 1);
		assert_eq!(q2.join().await.unwrap(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn items_run_in_submission_order() {
		let d: Dispatcher<usize> = Dispatcher::new(cfg(1, 1, 16)).unwrap();
		let ctx = CancellationToken::new();
		let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let mut handles = Vec::new();
		for i in 0..8usize {
			let order = order.clone();
			handles.push(
				d.submit(
					&ctx,
					Box::new(move |_| {
						Box::pin(async move {
							order.lock().push(i);
							i
						})
					}),
				)
				.unwrap(),
			);
		}
		for (i, h) in handles.into_iter().enumerate() {
			assert_eq!(h.join().await.unwrap(), i);
		}
		assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn cancelled_before_execution_never_runs() {
		let d: Dispatcher<u32> = Dispatcher::new(cfg(1, 1, 8)).unwrap();
		let ctx = CancellationToken::new();
		let sem = Arc::new(Semaphore::new(0));
		let started = Arc::new(AtomicUsize::new(0));
		let blocked = d
			.submit(&ctx, blocker(sem.clone(), started.clone()))
			.unwrap();
		assert!(wait_for(|| started.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await);

		let ran = Arc::new(AtomicBool::new(false));
		let ran2 = ran.clone();
		let queued = d
			.submit(
				&ctx,
				Box::new(move |_| {
					Box::pin(async move {
						ran2.store(true, Ordering::SeqCst);
						2
					})
				}),
			)
			.unwrap();
		queued.cancel();
		sem.add_permits(4);
		assert!(matches!(queued.join().await, Err(GatewayError::Cancelled)));
		assert!(!ran.load(Ordering::SeqCst));
		assert_eq!(blocked.join().await.unwrap(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn cancelled_during_execution_aborts_promptly() {
		let d: Dispatcher<u32> = Dispatcher::new(cfg(1, 1, 8)).unwrap();
		let ctx = CancellationToken::new();
		let started = Arc::new(AtomicUsize::new(0));
		let started2 = started.clone();
		let handle = d
			.submit(
				&ctx,
				Box::new(move |_| {
					Box::pin(async move {
						started2.fetch_add(1, Ordering::SeqCst);
						tokio::time::sleep(Duration::from_secs(30)).await;
						1
					})
				}),
			)
			.unwrap();
		assert!(wait_for(|| started.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await);
		let before = Instant::now();
		handle.cancel();
		assert!(matches!(handle.join().await, Err(GatewayError::Cancelled)));
		assert!(before.elapsed() < Duration::from_millis(100));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn scales_to_max_under_load_and_decays_to_min() {
		let d: Dispatcher<u32> = Dispatcher::new(cfg(1, 4, 4)).unwrap();
		let ctx = CancellationToken::new();
		let sem = Arc::new(Semaphore::new(0));
		let started = Arc::new(AtomicUsize::new(0));
		let mut handles = Vec::new();
		for _ in 0..8 {
			match d.submit(&ctx, blocker(sem.clone(), started.clone())) {
				Ok(h) => handles.push(h),
				Err(GatewayError::QueueFull) => break,
				Err(e) => panic!("unexpected submit error: {e}"),
			}
		}
		// Sustained pressure drives the pool to its ceiling.
		assert!(
			wait_for(|| d.stats().workers == 4, Duration::from_secs(2)).await,
			"workers stuck at {}",
			d.stats().workers
		);
		sem.add_permits(64);
		for h in handles {
			let _ = h.join().await;
		}
		// Idle utilization decays the pool back to the floor.
		assert!(
			wait_for(|| d.stats().workers == 1, Duration::from_secs(5)).await,
			"workers stuck at {}",
			d.stats().workers
		);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn shutdown_forces_cancellation_after_grace() {
		let d: Dispatcher<u32> = Dispatcher::new(cfg(1, 1, 8)).unwrap();
		let ctx = CancellationToken::new();
		let started = Arc::new(AtomicUsize::new(0));
		let started2 = started.clone();
		let stuck = d
			.submit(
				&ctx,
				Box::new(move |_| {
					Box::pin(async move {
						started2.fetch_add(1, Ordering::SeqCst);
						tokio::time::sleep(Duration::from_secs(60)).await;
						1
					})
				}),
			)
			.unwrap();
		assert!(wait_for(|| started.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await);
		let before = Instant::now();
		d.shutdown(Duration::from_millis(100)).await;
		assert!(before.elapsed() < Duration::from_secs(2));
		assert!(matches!(stuck.join().await, Err(GatewayError::Cancelled)));
		// New submissions are refused after shutdown.
		assert!(matches!(
			d.submit(&ctx, Box::new(|_| Box::pin(async { 1 }))),
			Err(GatewayError::QueueFull)
		));
	}

	#[tokio::test]
	async fn cancelled_context_is_rejected_at_submit() {
		let d: Dispatcher<u32> = Dispatcher::new(cfg(1, 2, 8)).unwrap();
		let ctx = CancellationToken::new();
		ctx.cancel();
		assert!(matches!(
			d.submit(&ctx, Box::new(|_| Box::pin(async { 1 }))),
			Err(GatewayError::Cancelled)
		));
	}

	#[test]
	fn config_validation_catches_bad_shapes() {
		assert!(cfg(2, 1, 8).validate().is_err());
		assert!(cfg(1, 2, 0).validate().is_err());
		let mut c = cfg(1, 2, 8);
		c.scale_down_threshold = 0.9;
		assert!(c.validate().is_err());
		assert!(DispatcherConfig::default().validate().is_ok());
	}
}
