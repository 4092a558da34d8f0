//! Log sink that ships records to the host as `DEBUGMSG` frames.
//!
//! The tunnel has no console of its own: every record is rendered as
//! `LEVEL: <ms-since-boot> == <message>` and framed onto the host channel,
//! sharing the pipe with the APDU traffic. The current level lives in the
//! `log` crate's global max-level atomic; it is mutated only by
//! `SET_LOGLEVEL` messages and read by every call site.

use alloc::string::String;
use core::fmt;

use hermit_sync::OnceCell;
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::drivers::{HostPort, Timer};
use crate::hostlink::{self, Opcode};

static LOGGER: OnceCell<HostLogger> = OnceCell::new();

struct HostLogger {
	host: &'static dyn HostPort,
	timer: &'static dyn Timer,
}

/// Install the host-channel logger. Subsequent calls are no-ops.
pub fn init(host: &'static dyn HostPort, timer: &'static dyn Timer) {
	if LOGGER.set(HostLogger { host, timer }).is_err() {
		return;
	}
	if let Some(logger) = LOGGER.get() {
		let _ = log::set_logger(logger);
	}
	log::set_max_level(LevelFilter::Debug);
}

impl Log for HostLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let line = render(record.level(), self.timer.now_us() / 1000, record.args());
		hostlink::write_frame(self.host, Opcode::DebugMsg, line.as_bytes());
	}

	fn flush(&self) {}
}

fn render(level: Level, uptime_ms: u64, args: &fmt::Arguments<'_>) -> String {
	format!("{} {} == {}", level_label(level), uptime_ms, args)
}

fn level_label(level: Level) -> &'static str {
	match level {
		Level::Error => "ERROR:",
		Level::Warn => "WARN:",
		Level::Info => "INFO:",
		Level::Debug => "DEBUG:",
		Level::Trace => "TRACE:",
	}
}

/// Apply a numeric level from a `SET_LOGLEVEL` payload.
pub fn set_level_byte(level: u8) {
	log::set_max_level(filter_from_byte(level));
}

/// The numeric level the host would have to send to select the current one.
pub fn current_level_byte() -> u8 {
	match log::max_level() {
		LevelFilter::Off | LevelFilter::Error | LevelFilter::Warn => 0,
		LevelFilter::Info => 1,
		LevelFilter::Debug => 2,
		LevelFilter::Trace => 3,
	}
}

fn filter_from_byte(level: u8) -> LevelFilter {
	match level {
		0 => LevelFilter::Warn,
		1 => LevelFilter::Info,
		2 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	}
}

/// Displays a byte slice the way the trace lines want it: ` 3B 9F 95`.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (index, byte) in self.0.iter().enumerate() {
			if index > 0 {
				write!(f, " ")?;
			}
			write!(f, "{:02X}", byte)?;
		}
		Ok(())
	}
}
