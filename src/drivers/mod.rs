//! Hardware seams of the relay engine.
//!
//! Everything the protocol code touches on the board is reached through the
//! object-safe traits in this module: the card-facing serial line, the host
//! byte pipe, the reset GPIO, the microsecond timer, the alarm pool and the
//! worker core. Board support implements them; the unit tests script them.
//!
//! All methods take `&self`: the implementations wrap hardware FIFOs and
//! registers that are interior-mutable by nature, and single handles are
//! shared between the two cores and the alarm callback.

#[cfg(test)]
pub(crate) mod mock;

use alloc::boxed::Box;

use crate::logging::HexBytes;
use crate::relay::WorkerTask;

/// Half-duplex byte I/O on the card-facing UART.
///
/// The required methods map onto the raw UART driver; the provided methods
/// implement the line discipline every protocol shares: receiver drain before
/// a transmission and echo readback of each transmitted byte (the card clock
/// loops our own bytes back on the contact line).
pub trait SerialLine: Send + Sync {
	/// Transmit one byte.
	fn putc(&self, byte: u8);

	/// Block until a byte arrives.
	fn getc(&self) -> u8;

	/// Wait at most `timeout_us` for one byte.
	fn getc_timeout(&self, timeout_us: u64) -> Option<u8>;

	/// Whether a received byte is pending.
	fn is_readable(&self) -> bool;

	/// Reprogram the baud rate, returning the rate actually achieved.
	fn set_baudrate(&self, baud: u32) -> u32;

	/// Block until the transmit FIFO has drained onto the wire.
	fn wait_tx_complete(&self);

	/// Discard pending receive bytes and wait out an ongoing transmission.
	fn drain(&self) {
		while self.is_readable() {
			let byte = self.getc();
			trace!("discard {:02x}", byte);
		}
		self.wait_tx_complete();
	}

	/// Write `buf`, reading back the line echo of every byte.
	///
	/// A mismatching echo is logged, not fatal: it is how a collision with
	/// the card's response shows up on a half-duplex line.
	fn write_echoed(&self, buf: &[u8]) -> usize {
		self.drain();
		for (index, &byte) in buf.iter().enumerate() {
			self.putc(byte);
			let echo = self.getc();
			if echo != byte {
				debug!("index[{}]: write: {:02X} read: {:02X}", index, byte, echo);
			}
		}
		buf.len()
	}

	/// Fill `buf`, blocking without a timeout (the reader is clocking us).
	fn read_exact(&self, buf: &mut [u8]) -> usize {
		for byte in buf.iter_mut() {
			*byte = self.getc();
		}
		trace!("read | {}", HexBytes(buf));
		buf.len()
	}
}

/// The byte pipe towards the host program, typically USB CDC.
pub trait HostPort: Send + Sync {
	/// Read up to `buf.len()` bytes, returning how many were stored.
	/// Returns 0 when nothing is pending.
	fn read(&self, buf: &mut [u8]) -> usize;

	/// Write all of `buf`.
	fn write(&self, buf: &[u8]);

	/// Fill `buf` completely, spinning until the host delivers.
	fn read_exact(&self, buf: &mut [u8]) {
		let backoff = crossbeam_utils::Backoff::new();
		let mut pos = 0;
		while pos < buf.len() {
			let read = self.read(&mut buf[pos..]);
			if read == 0 {
				backoff.snooze();
			}
			pos += read;
		}
	}
}

/// The reset contact from the reader, polled by the supervisor.
pub trait ResetLine: Send + Sync {
	fn is_high(&self) -> bool;
}

/// Time services: a microsecond uptime counter, a busy sleep and the
/// frequency counter on the card clock input.
pub trait Timer: Send + Sync {
	fn now_us(&self) -> u64;

	fn sleep_us(&self, us: u64);

	/// Measured frequency of the reader-supplied card clock, in Hz.
	fn card_clk_hz(&self) -> u32;
}

/// A rearmable one-shot alarm returned by [`AlarmPool::add_alarm_us`].
///
/// The callback runs in interrupt context on the core that created the pool.
/// Returning `Some(delay_us)` rearms the alarm, `None` retires it.
pub type AlarmCallback = Box<dyn FnMut() -> Option<u64> + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AlarmId(pub i32);

pub trait AlarmPool: Send + Sync {
	fn add_alarm_us(&self, delay_us: u64, callback: AlarmCallback) -> AlarmId;

	/// Cancel a pending alarm. Returns whether it was still armed.
	fn cancel(&self, id: AlarmId) -> bool;
}

/// Creates an [`AlarmPool`] bound to the calling core.
pub trait AlarmPoolFactory: Send + Sync {
	fn create_pool(&self) -> &'static dyn AlarmPool;
}

/// Control over the worker core.
///
/// `launch` starts the core at [`crate::relay::worker_entry`] with the given
/// task selector; `reset` stops it dead, discarding whatever it owned.
pub trait WorkerCore: Send + Sync {
	fn launch(&self, task: WorkerTask);

	fn reset(&self);
}

/// Every device handle the relay engine needs, bundled for passing around.
#[derive(Clone, Copy)]
pub struct Board {
	pub line: &'static dyn SerialLine,
	pub host: &'static dyn HostPort,
	pub reset: &'static dyn ResetLine,
	pub timer: &'static dyn Timer,
	pub alarms: &'static dyn AlarmPoolFactory,
	pub core1: &'static dyn WorkerCore,
}
