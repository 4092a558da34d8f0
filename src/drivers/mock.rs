//! Scripted devices for the host-run tests.
//!
//! The card line mock loops every transmitted byte back into the receive
//! queue (the echo a real contact line produces) and releases scripted
//! reader replies once a given number of bytes has left the wire, which is
//! how a half-duplex conversation stays ordered across the drain that
//! precedes every transmission.

use std::prelude::v1::*;
use std::vec::Vec;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::VecDeque;

use hermit_sync::SpinMutex;

use super::{
	AlarmCallback, AlarmId, AlarmPool, AlarmPoolFactory, Board, HostPort, ResetLine, SerialLine,
	Timer, WorkerCore,
};
use crate::config::CLK_DEFAULT_HZ;
use crate::relay::WorkerTask;

#[derive(Default)]
struct LineState {
	rx: VecDeque<u8>,
	tx: Vec<u8>,
	/// Reply bytes that become readable once `tx` reaches the given length.
	scripts: Vec<(usize, Vec<u8>)>,
	bauds: Vec<u32>,
}

pub struct MockLine {
	state: SpinMutex<LineState>,
}

impl MockLine {
	pub fn new() -> Self {
		Self {
			state: SpinMutex::new(LineState::default()),
		}
	}

	/// Make `bytes` readable right away.
	pub fn preload(&self, bytes: &[u8]) {
		self.script_after(0, bytes);
	}

	/// Make `bytes` readable once `tx_len` bytes have been transmitted.
	pub fn script_after(&self, tx_len: usize, bytes: &[u8]) {
		let mut state = self.state.lock();
		state.scripts.push((tx_len, bytes.to_vec()));
		Self::promote(&mut state);
	}

	fn promote(state: &mut LineState) {
		let tx_len = state.tx.len();
		let mut index = 0;
		while index < state.scripts.len() {
			if state.scripts[index].0 <= tx_len {
				let (_, bytes) = state.scripts.remove(index);
				state.rx.extend(bytes);
			} else {
				index += 1;
			}
		}
	}

	/// Everything transmitted so far.
	pub fn tx(&self) -> Vec<u8> {
		self.state.lock().tx.clone()
	}

	pub fn clear_tx(&self) {
		self.state.lock().tx.clear();
	}

	/// Baud rates programmed, in order.
	pub fn bauds(&self) -> Vec<u32> {
		self.state.lock().bauds.clone()
	}
}

impl SerialLine for MockLine {
	fn putc(&self, byte: u8) {
		let mut state = self.state.lock();
		state.tx.push(byte);
		// the contact line echoes our own bytes
		state.rx.push_back(byte);
		Self::promote(&mut state);
	}

	fn getc(&self) -> u8 {
		self.state
			.lock()
			.rx
			.pop_front()
			.expect("mock serial line ran out of scripted bytes")
	}

	fn getc_timeout(&self, _timeout_us: u64) -> Option<u8> {
		self.state.lock().rx.pop_front()
	}

	fn is_readable(&self) -> bool {
		!self.state.lock().rx.is_empty()
	}

	fn set_baudrate(&self, baud: u32) -> u32 {
		self.state.lock().bauds.push(baud);
		baud
	}

	fn wait_tx_complete(&self) {}
}

#[derive(Default)]
struct HostState {
	rx: VecDeque<u8>,
	tx: Vec<u8>,
}

pub struct MockHost {
	state: SpinMutex<HostState>,
}

impl MockHost {
	pub fn new() -> Self {
		Self {
			state: SpinMutex::new(HostState::default()),
		}
	}

	/// Queue a complete host frame for the device to read.
	pub fn queue_frame(&self, opcode: u8, payload: &[u8]) {
		let mut state = self.state.lock();
		state.rx.push_back(opcode);
		state.rx.extend((payload.len() as u32).to_ne_bytes());
		state.rx.extend(payload);
	}

	/// Everything the device wrote, as a raw byte stream.
	pub fn sent(&self) -> Vec<u8> {
		self.state.lock().tx.clone()
	}

	/// Everything the device wrote, split back into frames.
	pub fn sent_frames(&self) -> Vec<(u8, Vec<u8>)> {
		let bytes = self.sent();
		let mut frames = Vec::new();
		let mut index = 0;
		while index + 5 <= bytes.len() {
			let opcode = bytes[index];
			let len_bytes: [u8; 4] = bytes[index + 1..index + 5].try_into().unwrap();
			let len = u32::from_ne_bytes(len_bytes) as usize;
			let payload = bytes[index + 5..index + 5 + len].to_vec();
			frames.push((opcode, payload));
			index += 5 + len;
		}
		frames
	}
}

impl HostPort for MockHost {
	fn read(&self, buf: &mut [u8]) -> usize {
		let mut state = self.state.lock();
		assert!(
			!state.rx.is_empty(),
			"mock host ran out of scripted frames"
		);
		let mut read = 0;
		while read < buf.len() {
			match state.rx.pop_front() {
				Some(byte) => {
					buf[read] = byte;
					read += 1;
				}
				None => break,
			}
		}
		read
	}

	fn write(&self, buf: &[u8]) {
		self.state.lock().tx.extend_from_slice(buf);
	}
}

pub struct MockTimer {
	now_us: AtomicU64,
}

impl MockTimer {
	pub fn new() -> Self {
		Self {
			now_us: AtomicU64::new(0),
		}
	}

	pub fn advance(&self, us: u64) {
		self.now_us.fetch_add(us, Ordering::Relaxed);
	}
}

impl Timer for MockTimer {
	fn now_us(&self) -> u64 {
		// every look at the clock moves it, so durations come out nonzero
		self.now_us.fetch_add(1, Ordering::Relaxed)
	}

	fn sleep_us(&self, us: u64) {
		self.advance(us);
	}

	fn card_clk_hz(&self) -> u32 {
		CLK_DEFAULT_HZ
	}
}

#[derive(Default)]
struct AlarmState {
	callbacks: Vec<Option<AlarmCallback>>,
	armed: Vec<u64>,
	cancelled: usize,
}

pub struct MockAlarmPool {
	state: SpinMutex<AlarmState>,
}

impl MockAlarmPool {
	pub fn new() -> Self {
		Self {
			state: SpinMutex::new(AlarmState::default()),
		}
	}

	/// Run a pending alarm by hand, rearming it when the callback asks.
	pub fn fire(&self, id: AlarmId) {
		let callback = self.state.lock().callbacks[id.0 as usize].take();
		if let Some(mut callback) = callback {
			let rearm = callback();
			if rearm.is_some() {
				self.state.lock().callbacks[id.0 as usize] = Some(callback);
			}
		}
	}

	/// Delays of every alarm ever armed.
	pub fn armed(&self) -> Vec<u64> {
		self.state.lock().armed.clone()
	}

	pub fn cancelled(&self) -> usize {
		self.state.lock().cancelled
	}
}

impl AlarmPool for MockAlarmPool {
	fn add_alarm_us(&self, delay_us: u64, callback: AlarmCallback) -> AlarmId {
		let mut state = self.state.lock();
		state.armed.push(delay_us);
		state.callbacks.push(Some(callback));
		AlarmId((state.callbacks.len() - 1) as i32)
	}

	fn cancel(&self, id: AlarmId) -> bool {
		let mut state = self.state.lock();
		let was_armed = state.callbacks[id.0 as usize].take().is_some();
		if was_armed {
			state.cancelled += 1;
		}
		was_armed
	}
}

pub struct MockAlarmFactory {
	pool: &'static MockAlarmPool,
}

impl MockAlarmFactory {
	pub fn new(pool: &'static MockAlarmPool) -> Self {
		Self { pool }
	}
}

impl AlarmPoolFactory for MockAlarmFactory {
	fn create_pool(&self) -> &'static dyn AlarmPool {
		self.pool
	}
}

pub struct MockResetLine {
	highs_remaining: AtomicUsize,
}

impl MockResetLine {
	pub fn new() -> Self {
		Self {
			highs_remaining: AtomicUsize::new(0),
		}
	}

	/// Hold the line high for the next `polls` samples.
	pub fn raise_for(&self, polls: usize) {
		self.highs_remaining.store(polls, Ordering::Relaxed);
	}
}

impl ResetLine for MockResetLine {
	fn is_high(&self) -> bool {
		self.highs_remaining
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
			.is_ok()
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CoreEvent {
	Launch(WorkerTask),
	Reset,
}

pub struct MockWorkerCore {
	events: SpinMutex<Vec<CoreEvent>>,
}

impl MockWorkerCore {
	pub fn new() -> Self {
		Self {
			events: SpinMutex::new(Vec::new()),
		}
	}

	pub fn events(&self) -> Vec<CoreEvent> {
		self.events.lock().clone()
	}
}

impl WorkerCore for MockWorkerCore {
	fn launch(&self, task: WorkerTask) {
		self.events.lock().push(CoreEvent::Launch(task));
	}

	fn reset(&self) {
		self.events.lock().push(CoreEvent::Reset);
	}
}

/// A board whose reset line, worker core and alarm factory nobody looks at.
pub fn board_with(
	line: &'static MockLine,
	host: &'static MockHost,
	timer: &'static MockTimer,
) -> Board {
	let pool: &'static MockAlarmPool = Box::leak(Box::new(MockAlarmPool::new()));
	full_board(
		line,
		host,
		timer,
		Box::leak(Box::new(MockResetLine::new())),
		Box::leak(Box::new(MockWorkerCore::new())),
		Box::leak(Box::new(MockAlarmFactory::new(pool))),
	)
}

pub fn full_board(
	line: &'static MockLine,
	host: &'static MockHost,
	timer: &'static MockTimer,
	reset: &'static MockResetLine,
	core1: &'static MockWorkerCore,
	alarms: &'static MockAlarmFactory,
) -> Board {
	Board {
		line,
		host,
		reset,
		timer,
		alarms,
		core1,
	}
}
