use crossbeam_utils::Backoff;
use heapless::Deque;
use hermit_sync::SpinMutex;

/// A fixed-capacity queue connecting the supervisor core to the worker core.
///
/// One core pushes, the other pops; the spin lock only arbitrates the
/// occasional overlap of the two ends. Entries are plain values, never
/// references into the producer's state.
pub struct BoundedQueue<T, const N: usize> {
	items: SpinMutex<Deque<T, N>>,
}

impl<T, const N: usize> BoundedQueue<T, N> {
	pub const fn new() -> Self {
		Self {
			items: SpinMutex::new(Deque::new()),
		}
	}

	/// Append `value`, handing it back if the queue is full.
	pub fn try_push(&self, value: T) -> Result<(), T> {
		self.items.lock().push_back(value)
	}

	pub fn try_pop(&self) -> Option<T> {
		self.items.lock().pop_front()
	}

	/// Append `value`, spinning until a slot frees up.
	pub fn push(&self, value: T) {
		let backoff = Backoff::new();
		let mut value = value;
		loop {
			match self.try_push(value) {
				Ok(()) => return,
				Err(rejected) => value = rejected,
			}
			backoff.snooze();
		}
	}

	/// Pop the oldest entry, spinning until one arrives.
	pub fn pop(&self) -> T {
		let backoff = Backoff::new();
		loop {
			if let Some(value) = self.try_pop() {
				return value;
			}
			backoff.snooze();
		}
	}

	pub fn is_empty(&self) -> bool {
		self.items.lock().is_empty()
	}

	pub fn len(&self) -> usize {
		self.items.lock().len()
	}
}

impl<T, const N: usize> Default for BoundedQueue<T, N> {
	fn default() -> Self {
		Self::new()
	}
}
