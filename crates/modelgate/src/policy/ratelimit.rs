use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Atomic token bucket with interval refill. Acquisition is all-or-nothing;
/// `amend` supports true-up once the real cost of a request is known.
pub struct TokenBucket {
	capacity: u64,
	refill_amount: u64,
	refill_interval: Duration,
	available: AtomicU64,
	epoch: Instant,
	/// Nanoseconds since `epoch` of the next refill.
	refill_at: AtomicU64,
}

impl TokenBucket {
	pub fn new(capacity: u64, refill_amount: u64, refill_interval: Duration) -> Self {
		let epoch = Instant::now();
		TokenBucket {
			capacity,
			refill_amount,
			refill_interval,
			// Admission control wants a full bucket at startup.
			available: AtomicU64::new(capacity),
			epoch,
			refill_at: AtomicU64::new(refill_interval.as_nanos() as u64),
		}
	}

	fn now_nanos(&self) -> u64 {
		self.epoch.elapsed().as_nanos() as u64
	}

	pub fn available(&self) -> u64 {
		self.available.load(Ordering::Relaxed)
	}

	/// Time until the next refill is due.
	pub fn next_refill_in(&self) -> Duration {
		let due = self.refill_at.load(Ordering::Relaxed);
		Duration::from_nanos(due.saturating_sub(self.now_nanos()))
	}

	/// Issue any refills that have come due. Errs with the wait until the
	/// next refill when none are due yet.
	fn refill(&self, now: u64) -> Result<(), Duration> {
		let interval = self.refill_interval.as_nanos() as u64;
		let mut intervals;
		loop {
			let due = self.refill_at.load(Ordering::Acquire);
			if now < due {
				return Err(Duration::from_nanos(due - now));
			}
			intervals = (now - due) / interval + 1;
			let next = due + intervals * interval;
			// On a race, loop and re-check whether a refill is still due.
			if self
				.refill_at
				.compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				break;
			}
		}
		let amount = intervals.saturating_mul(self.refill_amount);
		let _ = self
			.available
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
				Some(v.saturating_add(amount).min(self.capacity))
			});
		Ok(())
	}

	/// Non-blocking acquisition of `n` tokens; all or none. On failure the
	/// error is a hint at when the next refill lands.
	pub fn try_acquire(&self, n: u64) -> Result<(), Duration> {
		if n == 0 {
			return Ok(());
		}
		if n > self.capacity {
			return Err(self.next_refill_in());
		}
		loop {
			let refill_result = self.refill(self.now_nanos());
			loop {
				let available = self.available.load(Ordering::Acquire);
				if available < n {
					match refill_result {
						// Refill succeeded but a racer took the tokens; try again.
						Ok(()) => break,
						Err(wait) => return Err(wait),
					}
				}
				if self
					.available
					.compare_exchange(available, available - n, Ordering::AcqRel, Ordering::Acquire)
					.is_ok()
				{
					return Ok(());
				}
			}
		}
	}

	/// Remove (positive) or return (negative) tokens after the fact, for
	/// true-up once the response reports real counts. Saturates at the
	/// bucket bounds; never fails.
	pub fn amend(&self, tokens_to_remove: i64) {
		if tokens_to_remove == 0 {
			return;
		}
		let _ = self
			.available
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
				if tokens_to_remove < 0 {
					Some(
						v.saturating_add(tokens_to_remove.unsigned_abs())
							.min(self.capacity),
					)
				} else {
					Some(v.saturating_sub(tokens_to_remove.unsigned_abs()))
				}
			});
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
	Rpm,
	Tpm,
}

impl Scope {
	pub fn as_str(&self) -> &'static str {
		match self {
			Scope::Rpm => "rpm",
			Scope::Tpm => "tpm",
		}
	}
}

/// Buckets keyed by `(api_key_id, scope)`, created lazily from the tenant's
/// per-minute allowances.
#[derive(Default)]
pub struct RateLimiters {
	buckets: RwLock<HashMap<(String, Scope), Arc<TokenBucket>>>,
}

impl RateLimiters {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn bucket(&self, api_key_id: &str, scope: Scope, per_minute: u64) -> Arc<TokenBucket> {
		if let Some(b) = self
			.buckets
			.read()
			.get(&(api_key_id.to_string(), scope))
			.cloned()
		{
			return b;
		}
		let mut buckets = self.buckets.write();
		buckets
			.entry((api_key_id.to_string(), scope))
			.or_insert_with(|| {
				Arc::new(TokenBucket::new(
					per_minute,
					per_minute,
					Duration::from_secs(60),
				))
			})
			.clone()
	}
}
