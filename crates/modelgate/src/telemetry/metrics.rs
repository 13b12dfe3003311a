use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::hash::Hash;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub provider: String,
	pub model: String,
	pub status: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
	pub code: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ProviderLabels {
	pub provider: String,
}

#[derive(Debug)]
pub struct Metrics {
	pub requests: Family<RequestLabels, Counter>,
	pub rejections: Family<RejectionLabels, Counter>,
	pub provider_auth_errors: Family<ProviderLabels, Counter>,
	pub usage_write_failures: Counter,
	pub queue_depth: Gauge,
	pub workers: Gauge,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		fn build<T: Clone + Hash + Eq + EncodeLabelSet + std::fmt::Debug + Send + Sync + 'static>(
			registry: &mut Registry,
			name: &str,
			help: &str,
		) -> Family<T, Counter> {
			let m = Family::default();
			registry.register(name, help, m.clone());
			m
		}
		let requests = build(
			registry,
			"modelgate_requests",
			"Completed provider calls by provider, model and status",
		);
		let rejections = build(
			registry,
			"modelgate_rejections",
			"Requests rejected before or during dispatch, by error code",
		);
		let provider_auth_errors = build(
			registry,
			"modelgate_provider_auth_errors",
			"Upstream credential rejections; each one is an operational alert",
		);
		let usage_write_failures = Counter::default();
		registry.register(
			"modelgate_usage_write_failures",
			"Usage or violation records that could not be persisted",
			usage_write_failures.clone(),
		);
		let queue_depth = Gauge::default();
		registry.register(
			"modelgate_dispatch_queue_depth",
			"Work items currently queued in the dispatcher",
			queue_depth.clone(),
		);
		let workers = Gauge::default();
		registry.register(
			"modelgate_dispatch_workers",
			"Dispatcher workers currently running",
			workers.clone(),
		);
		Metrics {
			requests,
			rejections,
			provider_auth_errors,
			usage_write_failures,
			queue_depth,
			workers,
		}
	}

	#[cfg(test)]
	pub fn new_for_tests() -> Self {
		Metrics::new(&mut Registry::default())
	}
}
