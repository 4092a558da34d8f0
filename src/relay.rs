//! The two-core relay supervisor.
//!
//! One core owns the reset line, the authoritative ATR and the host-facing
//! configuration state; the other runs exactly one of the waiting, T=0 or
//! T=1 loops. Every rising edge on the reset line tears the worker down and
//! relaunches it with a fresh snapshot of the configuration, handed over
//! by value through a bounded queue so the worker never sees the
//! supervisor's mutable state.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::atr::{AnswerToReset, Protocol};
use crate::config::{
	APDU_BUFFER_LEN, BOOT_CONFIGURED_CLK_HZ, RESET_POLL_INTERVAL_US, RESET_SETTLE_US,
};
use crate::drivers::{AlarmPool, Board};
use crate::hostlink::HostChannel;
use crate::logging::{self, HexBytes};
use crate::synch::queue::BoundedQueue;
use crate::{t0, t1};

/// Supervisor state as reported to `REQUEST_STATE` queries.
#[derive(TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum RelayState {
	NeedAtr = 0,
	RdyToRelay = 1,
}

/// Clock source feeding the card UART.
#[derive(TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum UartMode {
	/// The reader's clock is measured from the clock contact.
	Synchronous = 0,
	/// A configured fixed clock is assumed.
	Asynchronous = 1,
}

#[cfg(feature = "uart-asynchronous")]
const BOOT_UART_MODE: UartMode = UartMode::Asynchronous;
#[cfg(not(feature = "uart-asynchronous"))]
const BOOT_UART_MODE: UartMode = UartMode::Synchronous;

/// Written by the supervisor once the first ATR is in, read from the host
/// channel reader on either core.
static STATE: AtomicU8 = AtomicU8::new(RelayState::NeedAtr as u8);

/// Written on `SET_UARTMODE` (host channel reader) and at session start;
/// read everywhere a clock source has to be picked. Relaxed ordering: the
/// values are self-contained bytes and words.
static UART_MODE: AtomicU8 = AtomicU8::new(BOOT_UART_MODE as u8);
static CONFIGURED_CLK: AtomicU32 = AtomicU32::new(BOOT_CONFIGURED_CLK_HZ);

pub fn current_state() -> u8 {
	STATE.load(Ordering::Relaxed)
}

fn set_state(state: RelayState) {
	STATE.store(state as u8, Ordering::Relaxed);
}

pub fn uart_mode() -> UartMode {
	UartMode::try_from(UART_MODE.load(Ordering::Relaxed)).unwrap_or(UartMode::Synchronous)
}

pub fn configured_clk_hz() -> u32 {
	CONFIGURED_CLK.load(Ordering::Relaxed)
}

/// Apply a `SET_UARTMODE` request to the process-wide scalars. A zero clock
/// keeps the previous one; the clock only matters in asynchronous mode.
pub(crate) fn apply_uart_mode(mode: u8, clk_hz: u32) {
	let old_mode = UART_MODE.load(Ordering::Relaxed);
	if mode == UartMode::Asynchronous as u8 {
		let clk = if clk_hz > 0 {
			clk_hz
		} else {
			configured_clk_hz()
		};
		info!(
			"change uart mode from {} to {} and clock from {} to {}",
			old_mode,
			mode,
			configured_clk_hz(),
			clk
		);
		CONFIGURED_CLK.store(clk, Ordering::Relaxed);
	} else {
		info!("change uart mode from {} to {}", old_mode, mode);
	}
	UART_MODE.store(mode, Ordering::Relaxed);
}

/// Seed the worker-side scalars from the configuration snapshot a session
/// was launched with.
pub(crate) fn apply_session_atomics(config: &SessionConfig) {
	UART_MODE.store(config.uart_mode as u8, Ordering::Relaxed);
	CONFIGURED_CLK.store(config.clk_hz, Ordering::Relaxed);
	logging::set_level_byte(config.log_level);
}

/// Value snapshot handed to the worker at launch. No pointers into the
/// supervisor's state: the ATR payload travels by copy.
#[derive(Clone)]
pub struct SessionConfig {
	pub atr: AnswerToReset,
	pub alarm_pool: &'static dyn AlarmPool,
	pub uart_mode: UartMode,
	pub clk_hz: u32,
	pub log_level: u8,
}

pub struct AtrUpdate {
	pub atr: AnswerToReset,
}

pub struct UartModeUpdate {
	pub mode: u8,
	pub clk_hz: u32,
}

pub struct LogLevelUpdate {
	pub level: u8,
}

/// The four cross-core queues. The supervisor produces session
/// configurations and consumes updates; the host channel reader on the
/// worker core produces updates.
pub struct Channels {
	pub config: BoundedQueue<SessionConfig, 2>,
	pub atr_updates: BoundedQueue<AtrUpdate, 2>,
	pub uart_mode_updates: BoundedQueue<UartModeUpdate, 2>,
	pub log_level_updates: BoundedQueue<LogLevelUpdate, 2>,
}

impl Channels {
	pub const fn new() -> Self {
		Self {
			config: BoundedQueue::new(),
			atr_updates: BoundedQueue::new(),
			uart_mode_updates: BoundedQueue::new(),
			log_level_updates: BoundedQueue::new(),
		}
	}
}

impl Default for Channels {
	fn default() -> Self {
		Self::new()
	}
}

/// What the worker core has been launched to do.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkerTask {
	/// Create an alarm pool bound to the worker core, push it through the
	/// config queue and park.
	CreateAlarmPool,
	/// No protocol yet: serve the host channel so configuration can change
	/// before the first reset.
	Waiting,
	T0,
	T1,
}

/// Entry point for the worker core; board support calls this from the
/// launch stub with the task the supervisor selected.
pub fn worker_entry(board: Board, channels: &'static Channels, task: WorkerTask) -> ! {
	match task {
		WorkerTask::CreateAlarmPool => create_alarm_pool_entry(board, channels),
		WorkerTask::Waiting => waiting_loop(board, channels),
		WorkerTask::T0 => t0::run_session(board, channels),
		WorkerTask::T1 => t1::run_session(board, channels),
	}
}

fn create_alarm_pool_entry(board: Board, channels: &'static Channels) -> ! {
	let pool = board.alarms.create_pool();
	channels.config.push(SessionConfig {
		atr: AnswerToReset::default(),
		alarm_pool: pool,
		uart_mode: uart_mode(),
		clk_hz: configured_clk_hz(),
		log_level: logging::current_level_byte(),
	});
	// parked until the supervisor resets this core
	loop {
		core::hint::spin_loop();
	}
}

fn waiting_loop(board: Board, channels: &'static Channels) -> ! {
	let link = HostChannel::new(board.host);
	let mut buf = vec![0u8; APDU_BUFFER_LEN];
	trace!("wait for config");
	loop {
		link.read_apdu(&mut buf, channels, parse_clk(&board));
	}
}

/// The clock ATR timing parameters are derived against right now.
fn parse_clk(board: &Board) -> u32 {
	match uart_mode() {
		UartMode::Synchronous => board.timer.card_clk_hz(),
		UartMode::Asynchronous => configured_clk_hz(),
	}
}

/// Keep asking the host for an ATR until a parseable one arrives.
fn await_first_atr(link: &HostChannel, board: &Board) -> AnswerToReset {
	loop {
		debug!("requesting first ATR");
		link.request_atr();
		if let Some(atr) = link.read_atr(parse_clk(board)) {
			return atr;
		}
	}
}

/// Create the WTX alarm pool on the worker core: launch the pool-creation
/// stub, take the handle out of the config queue, reset the core.
fn create_alarm_pool(board: &Board, channels: &'static Channels) -> &'static dyn AlarmPool {
	board.core1.launch(WorkerTask::CreateAlarmPool);
	let config = channels.config.pop();
	board.core1.reset();
	config.alarm_pool
}

/// The supervisor once booted: the reset-edge dispatcher and the update
/// drain.
pub struct Supervisor {
	board: Board,
	channels: &'static Channels,
	atr: AnswerToReset,
	alarm_pool: &'static dyn AlarmPool,
}

impl Supervisor {
	pub fn new(
		board: Board,
		channels: &'static Channels,
		atr: AnswerToReset,
		alarm_pool: &'static dyn AlarmPool,
	) -> Self {
		Self {
			board,
			channels,
			atr,
			alarm_pool,
		}
	}

	fn session_config(&self) -> SessionConfig {
		SessionConfig {
			atr: self.atr.clone(),
			alarm_pool: self.alarm_pool,
			uart_mode: uart_mode(),
			clk_hz: configured_clk_hz(),
			log_level: logging::current_level_byte(),
		}
	}

	/// Push a configuration snapshot for the next worker launch.
	pub fn seed_config(&self) {
		self.channels.config.push(self.session_config());
	}

	/// One iteration of the supervisor loop.
	pub fn poll(&mut self) {
		if self.board.reset.is_high() {
			self.start_session();
		}
		self.drain_updates();
	}

	/// A reset edge: kill the worker, reseed the configuration and launch
	/// the protocol the current ATR selects, then wait out the pulse.
	fn start_session(&mut self) {
		info!(
			"trigger detected: reset worker core, {}",
			self.board.timer.now_us()
		);
		self.board.core1.reset();
		while self.channels.config.try_pop().is_some() {
			debug!("remove stale session config");
		}
		self.seed_config();
		match self.atr.protocol {
			Protocol::T1 => {
				info!("launch t1");
				self.board.core1.launch(WorkerTask::T1);
			}
			Protocol::T0 => {
				info!("launch t0");
				self.board.core1.launch(WorkerTask::T0);
			}
			Protocol::Unknown => debug!("ATR parsing failed"),
		}
		while self.board.reset.is_high() {
			self.board.timer.sleep_us(RESET_POLL_INTERVAL_US);
		}
		self.board.timer.sleep_us(RESET_POLL_INTERVAL_US);
	}

	/// Apply whatever the host channel reader queued up, so the next reset
	/// picks it up.
	fn drain_updates(&mut self) {
		if let Some(update) = self.channels.atr_updates.try_pop() {
			self.atr = update.atr;
			debug!("new ATR | {}", HexBytes(&self.atr.payload));
		}
		if let Some(update) = self.channels.uart_mode_updates.try_pop() {
			apply_uart_mode(update.mode, update.clk_hz);
		}
		if let Some(update) = self.channels.log_level_updates.try_pop() {
			logging::set_level_byte(update.level);
			debug!("new loglevel {}", update.level);
		}
	}
}

/// Supervisor-core entry point. Never returns; the worker core is driven
/// from here via [`WorkerTask`] launches.
pub fn run(board: Board, channels: &'static Channels) -> ! {
	logging::init(board.host, board.timer);
	let link = HostChannel::new(board.host);
	let alarm_pool = create_alarm_pool(&board, channels);

	let atr = await_first_atr(&link, &board);
	set_state(RelayState::RdyToRelay);
	board.timer.sleep_us(RESET_SETTLE_US);

	let mut supervisor = Supervisor::new(board, channels, atr, alarm_pool);
	// let the worker serve configuration requests until the first reset
	supervisor.seed_config();
	board.core1.launch(WorkerTask::Waiting);

	loop {
		supervisor.poll();
	}
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
	use std::prelude::v1::*;

	use super::*;
	use crate::drivers::mock::{
		CoreEvent, MockAlarmFactory, MockAlarmPool, MockHost, MockLine, MockResetLine,
		MockTimer, MockWorkerCore, full_board,
	};

	struct Fixture {
		board: Board,
		channels: &'static Channels,
		host: &'static MockHost,
		pool: &'static MockAlarmPool,
		reset: &'static MockResetLine,
		core: &'static MockWorkerCore,
	}

	fn fixture() -> Fixture {
		let line: &'static MockLine = Box::leak(Box::new(MockLine::new()));
		let host: &'static MockHost = Box::leak(Box::new(MockHost::new()));
		let timer: &'static MockTimer = Box::leak(Box::new(MockTimer::new()));
		let reset: &'static MockResetLine = Box::leak(Box::new(MockResetLine::new()));
		let core: &'static MockWorkerCore = Box::leak(Box::new(MockWorkerCore::new()));
		let pool: &'static MockAlarmPool = Box::leak(Box::new(MockAlarmPool::new()));
		let alarms: &'static MockAlarmFactory =
			Box::leak(Box::new(MockAlarmFactory::new(pool)));
		let board = full_board(line, host, timer, reset, core, alarms);
		let channels: &'static Channels = Box::leak(Box::new(Channels::new()));
		Fixture {
			board,
			channels,
			host,
			pool,
			reset,
			core,
		}
	}

	#[test]
	fn bootstrap_requests_the_atr_with_an_empty_sendatr() {
		let f = fixture();
		let link = HostChannel::new(f.board.host);
		f.host
			.queue_frame(0x03, &[0x3B, 0x9F, 0x95, 0x80, 0x1F, 0xC7, 0x80, 0x31]);
		let atr = await_first_atr(&link, &f.board);

		let frames = f.host.sent_frames();
		assert_eq!(frames[0].0, 0x03);
		assert!(frames[0].1.is_empty());
		assert_eq!(atr.payload.len(), 8);
		// TD1 = 0x80 selects T=0, TA1 = 0x95 the 512/16 dividers
		assert_eq!(atr.protocol, Protocol::T0);
		assert_eq!(atr.f, 512);
		assert_eq!(atr.d, 16);
	}

	#[test]
	fn unparseable_atr_is_requested_again() {
		let f = fixture();
		let link = HostChannel::new(f.board.host);
		f.host.queue_frame(0x03, &[0x11, 0x22]);
		f.host.queue_frame(0x03, &[0x3B, 0x80, 0x01]);
		let atr = await_first_atr(&link, &f.board);
		assert_eq!(atr.protocol, Protocol::T1);
		// one SENDATR request per attempt
		let requests = f
			.host
			.sent_frames()
			.iter()
			.filter(|(op, _)| *op == 0x03)
			.count();
		assert_eq!(requests, 2);
	}

	#[test]
	fn reset_edge_launches_the_protocol_from_the_atr() {
		let f = fixture();
		let mut atr = AnswerToReset::default();
		atr.protocol = Protocol::T1;
		let mut supervisor = Supervisor::new(f.board, f.channels, atr, f.pool);

		// a stale config from the previous session is discarded
		supervisor.seed_config();
		f.reset.raise_for(3);
		supervisor.poll();

		assert_eq!(
			f.core.events(),
			vec![CoreEvent::Reset, CoreEvent::Launch(WorkerTask::T1)]
		);
		assert_eq!(f.channels.config.len(), 1);
	}

	#[test]
	fn unknown_protocol_is_not_launched() {
		let f = fixture();
		let mut supervisor =
			Supervisor::new(f.board, f.channels, AnswerToReset::default(), f.pool);
		f.reset.raise_for(2);
		supervisor.poll();

		assert_eq!(f.core.events(), vec![CoreEvent::Reset]);
	}

	#[test]
	fn atr_updates_replace_the_supervisor_copy() {
		let f = fixture();
		let mut supervisor =
			Supervisor::new(f.board, f.channels, AnswerToReset::default(), f.pool);
		let new_atr = AnswerToReset::parse(&[0x3B, 0x80, 0x01], 3_571_200);
		f.channels
			.atr_updates
			.try_push(AtrUpdate { atr: new_atr })
			.ok();
		supervisor.poll();
		assert_eq!(supervisor.atr.protocol, Protocol::T1);
		assert_eq!(supervisor.session_config().atr.protocol, Protocol::T1);
	}
}
