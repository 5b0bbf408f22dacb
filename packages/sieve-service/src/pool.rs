//! Bounded fan-out for independent units of work.
//!
//! Units run on a semaphore-limited `JoinSet` and are fanned back in by launch index, so callers
//! merge results in a deterministic order regardless of completion order.

use std::{
	future::Future,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use tokio::{
	sync::{Notify, Semaphore},
	task::JoinSet,
};

/// Cooperative cancellation shared by a run's controller and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
	inner: Arc<CancelInner>,
}
impl CancelToken {
	pub fn cancel(&self) {
		self.inner.flag.store(true, Ordering::SeqCst);
		self.inner.notify.notify_waiters();
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.flag.load(Ordering::SeqCst)
	}

	pub async fn cancelled(&self) {
		loop {
			let notified = self.inner.notify.notified();

			if self.is_cancelled() {
				return;
			}

			notified.await;
		}
	}
}

#[derive(Debug, Default)]
struct CancelInner {
	flag: AtomicBool,
	notify: Notify,
}

#[derive(Debug)]
pub struct PoolRun<T> {
	/// Finished units as `(launch index, output)`, sorted by index.
	pub completed: Vec<(usize, T)>,
	/// Units that panicked, with the panic message.
	pub panicked: Vec<(usize, String)>,
	pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct WorkPool {
	semaphore: Arc<Semaphore>,
	cancel: CancelToken,
	abandon_on_cancel: bool,
}
impl WorkPool {
	pub fn new(max_concurrency: u32, cancel: CancelToken, abandon_on_cancel: bool) -> Self {
		let permits = usize::try_from(max_concurrency.max(1)).unwrap_or(1);

		Self { semaphore: Arc::new(Semaphore::new(permits)), cancel, abandon_on_cancel }
	}

	/// Runs every unit. After cancellation no new unit starts; units already running either
	/// finish (and are reported) or are aborted, depending on `abandon_on_cancel`.
	pub async fn run_all<T, Fut>(&self, units: Vec<Fut>) -> PoolRun<T>
	where
		T: Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		let mut set = JoinSet::new();
		let mut cancelled = false;
		let mut task_index = Vec::with_capacity(units.len());

		for (index, unit) in units.into_iter().enumerate() {
			if self.cancel.is_cancelled() {
				cancelled = true;

				break;
			}

			let semaphore = self.semaphore.clone();
			let cancel = self.cancel.clone();
			let handle = set.spawn(async move {
				let Ok(_permit) = semaphore.acquire_owned().await else {
					return (index, None);
				};

				if cancel.is_cancelled() {
					return (index, None);
				}

				(index, Some(unit.await))
			});

			task_index.push((handle.id(), index));
		}

		let mut completed = Vec::new();
		let mut panicked = Vec::new();

		loop {
			tokio::select! {
				joined = set.join_next() => match joined {
					None => break,
					Some(Ok((index, Some(output)))) => completed.push((index, output)),
					Some(Ok((_, None))) => cancelled = true,
					Some(Err(err)) if err.is_cancelled() => cancelled = true,
					Some(Err(err)) => {
						let index = task_index
							.iter()
							.find(|(id, _)| *id == err.id())
							.map(|(_, index)| *index)
							.unwrap_or(usize::MAX);

						tracing::error!(unit = index, error = %err, "Work unit panicked.");
						panicked.push((index, err.to_string()));
					},
				},
				_ = self.cancel.cancelled(), if self.abandon_on_cancel && !cancelled => {
					tracing::info!(in_flight = set.len(), "Abandoning in-flight work units.");
					set.abort_all();

					cancelled = true;
				},
			}
		}

		completed.sort_by_key(|(index, _)| *index);
		panicked.sort_by_key(|(index, _)| *index);

		PoolRun { completed, panicked, cancelled: cancelled || self.cancel.is_cancelled() }
	}
}
