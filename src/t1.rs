//! T=1 block transmission protocol.
//!
//! A block (TPDU) is `NAD | PCB | LEN | INF[LEN] | LRC` with the LRC the XOR
//! of everything before it. The reader sends I-blocks carrying command
//! APDUs, R-blocks acknowledging or rejecting our blocks and S-blocks for
//! link management; we relay the I-block payloads to the host and chain the
//! responses back, stretching the block waiting time with S(WTX) requests
//! while the host thinks.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::atr::{baudrate, di_value, fi_value};
use crate::config::{
	APDU_BUFFER_LEN, DEFAULT_BAUD, DEFAULT_IFS, MAX_INF_LEN, PPS_BYTE, UART_READ_TIMEOUT_US,
	WAITING_TIME_EXTENSION_MULTIPLIER,
};
use crate::drivers::{AlarmPool, Board, SerialLine};
use crate::hostlink::HostChannel;
use crate::logging::HexBytes;
use crate::relay::{self, Channels, SessionConfig, UartMode};

/// Sequence counter shared between the session loop and the WTX alarm
/// callback; its parity is the send-sequence bit. Written by the worker core
/// only (the callback fires while the worker is blocked on the host, per the
/// alarm contract), so relaxed ordering is enough.
pub(crate) static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// One T=1 block, prologue and information field. The epilogue (LRC) is
/// computed, never stored.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Tpdu {
	pub nad: u8,
	pub pcb: u8,
	pub inf: heapless::Vec<u8, { MAX_INF_LEN + 1 }>,
}

impl Tpdu {
	pub fn new(nad: u8, pcb: u8, inf: &[u8]) -> Self {
		let mut tpdu = Self {
			nad,
			pcb,
			inf: heapless::Vec::new(),
		};
		let _ = tpdu.inf.extend_from_slice(inf);
		tpdu
	}

	pub fn len(&self) -> u8 {
		self.inf.len() as u8
	}

	pub fn is_empty(&self) -> bool {
		self.inf.is_empty()
	}

	/// XOR of NAD, PCB, LEN and the information field.
	pub fn lrc(&self) -> u8 {
		let mut lrc = self.nad ^ self.pcb ^ self.len();
		for byte in &self.inf {
			lrc ^= byte;
		}
		lrc
	}

	pub fn kind(&self) -> BlockKind {
		if self.pcb & 0x80 == 0 {
			BlockKind::Information
		} else if self.pcb & 0x40 == 0 {
			BlockKind::Receive
		} else {
			BlockKind::Supervisory
		}
	}
}

impl fmt::Display for Tpdu {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:02X} {:02X} {:02X} {} {:02X}",
			self.nad,
			self.pcb,
			self.len(),
			HexBytes(&self.inf),
			self.lrc()
		)
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockKind {
	Information,
	Receive,
	Supervisory,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RBlockKind {
	NoError,
	ParityError,
	OtherError,
	Malformed,
}

/// R-block meaning from its PCB; bit 4 carries the expected sequence number
/// and does not affect the classification.
pub fn classify_r_block(pcb: u8) -> RBlockKind {
	match pcb {
		0x80 | 0x90 => RBlockKind::NoError,
		0x81 | 0x91 => RBlockKind::ParityError,
		0x82 | 0x92 => RBlockKind::OtherError,
		_ => RBlockKind::Malformed,
	}
}

/// What [`read_block`] produced.
#[derive(Debug)]
pub enum ReadOutcome {
	Block(Tpdu),
	/// A byte stayed out longer than the per-byte window.
	Timeout,
	/// The epilogue did not match; the reader should see an error R-block.
	ChecksumMismatch,
	/// The frame opened with PPSS (0xFF): the PPS was echoed and the baud
	/// switched, nothing is handed up.
	PpsHandled,
}

/// Read one block with a per-byte timeout.
///
/// A frame starting with NAD 0xFF is not a block but a PPS request: the four
/// PPS bytes are echoed back, the new dividers are taken from PPS1 and the
/// UART is reprogrammed against `clk_hz`.
pub fn read_block(line: &dyn SerialLine, clk_hz: u32) -> ReadOutcome {
	let Some(nad) = line.getc_timeout(UART_READ_TIMEOUT_US) else {
		return ReadOutcome::Timeout;
	};
	let Some(pcb) = line.getc_timeout(UART_READ_TIMEOUT_US) else {
		return ReadOutcome::Timeout;
	};
	let Some(len) = line.getc_timeout(UART_READ_TIMEOUT_US) else {
		return ReadOutcome::Timeout;
	};

	if nad == PPS_BYTE {
		let Some(pck) = line.getc_timeout(UART_READ_TIMEOUT_US) else {
			return ReadOutcome::Timeout;
		};
		let pps = [nad, pcb, len, pck];
		line.write_echoed(&pps);
		let f = fi_value(len);
		let d = di_value(len);
		line.wait_tx_complete();
		let baud = line.set_baudrate(baudrate(f, d, clk_hz));
		info!("set baudrate = {}", baud);
		return ReadOutcome::PpsHandled;
	}

	let mut tpdu = Tpdu::new(nad, pcb, &[]);
	for _ in 0..len {
		let Some(byte) = line.getc_timeout(UART_READ_TIMEOUT_US) else {
			return ReadOutcome::Timeout;
		};
		let _ = tpdu.inf.push(byte);
	}
	let Some(check) = line.getc_timeout(UART_READ_TIMEOUT_US) else {
		return ReadOutcome::Timeout;
	};
	trace!("read |{}", tpdu);
	if check != tpdu.lrc() {
		return ReadOutcome::ChecksumMismatch;
	}
	ReadOutcome::Block(tpdu)
}

/// Serialize one block, reading back the line echo of every byte.
pub fn write_block(line: &dyn SerialLine, tpdu: &Tpdu) {
	trace!("t1_write |{}", tpdu);
	let prologue = [tpdu.nad, tpdu.pcb, tpdu.len()];
	for (index, &byte) in prologue
		.iter()
		.chain(tpdu.inf.iter())
		.chain([tpdu.lrc()].iter())
		.enumerate()
	{
		line.putc(byte);
		let echo = line.getc();
		if echo != byte {
			info!("index[{}] write: {:02X} read: {:02X}", index, byte, echo);
		}
	}
}

/// Serialize one block with a deliberately wrong LRC, to probe the peer's
/// error handling.
pub fn write_block_faulty(line: &dyn SerialLine, tpdu: &Tpdu) {
	info!("write faulty |{}", tpdu);
	let prologue = [tpdu.nad, tpdu.pcb, tpdu.len()];
	let bad_lrc = tpdu.lrc() ^ 0x11;
	for &byte in prologue
		.iter()
		.chain(tpdu.inf.iter())
		.chain([bad_lrc].iter())
	{
		line.putc(byte);
		let echo = line.getc();
		if echo != byte {
			debug!("write: {:02X} read: {:02X}", byte, echo);
		}
	}
}

/// Write the send-sequence bit (PCB bit 6) from the counter's parity.
pub fn adjust_sequence_bit(seq: &AtomicU32, pcb: &mut u8) {
	if seq.load(Ordering::Relaxed) % 2 == 0 {
		*pcb &= 0xBF;
	} else {
		*pcb |= 0x40;
	}
}

/// Outcome of an S-block exchange.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SBlockDisposition {
	/// A response to a request of ours; nothing more to do.
	ResponseOk,
	/// Resync request: answered, sequence and IFS are back at defaults.
	Resync,
	/// IFS request: answered, the new accepted size is in effect.
	IfsNegotiated(u8),
	/// Abort request: answered.
	Abort,
	/// WTX request from the reader: answered.
	WtxAnswered,
	/// Not an S-block PCB we know; ignored so the reader can retry.
	Unknown,
}

/// Answer a supervisory block.
pub fn handle_s_block(
	line: &dyn SerialLine,
	seq: &AtomicU32,
	tpdu: &Tpdu,
	accepted_size: &mut u8,
) -> SBlockDisposition {
	match tpdu.pcb {
		0xC0 => {
			trace!("resync request");
			let reply = Tpdu::new(0x00, 0xE0, &[]);
			write_block(line, &reply);
			seq.store(0, Ordering::Relaxed);
			*accepted_size = DEFAULT_IFS;
			SBlockDisposition::Resync
		}
		0xC1 => {
			trace!("IFS request");
			if let Some(&size) = tpdu.inf.first() {
				*accepted_size = size;
			}
			let reply = Tpdu::new(tpdu.nad, 0xE1, &tpdu.inf);
			write_block(line, &reply);
			seq.fetch_add(1, Ordering::Relaxed);
			SBlockDisposition::IfsNegotiated(*accepted_size)
		}
		0xC2 => {
			trace!("abort request");
			let reply = Tpdu::new(0x00, 0xE2, &[]);
			write_block(line, &reply);
			seq.fetch_add(1, Ordering::Relaxed);
			SBlockDisposition::Abort
		}
		0xC3 => {
			trace!("waiting time extension request");
			let reply = Tpdu::new(tpdu.nad, 0xE3, &tpdu.inf);
			write_block(line, &reply);
			seq.fetch_add(1, Ordering::Relaxed);
			SBlockDisposition::WtxAnswered
		}
		0xE1 => {
			trace!("IFS response success");
			SBlockDisposition::ResponseOk
		}
		0xE2 => {
			trace!("abort response success");
			SBlockDisposition::ResponseOk
		}
		0xE3 => {
			trace!("WTX response success");
			SBlockDisposition::ResponseOk
		}
		_ => {
			trace!("unknown S block, ignoring");
			SBlockDisposition::Unknown
		}
	}
}

/// Ask the reader to keep waiting: S(WTX request) with the fixed multiplier,
/// expecting S(WTX response) back.
pub fn send_wtx_request(line: &dyn SerialLine, seq: &AtomicU32, clk_hz: u32) -> bool {
	let request = Tpdu::new(0x00, 0xC3, &[WAITING_TIME_EXTENSION_MULTIPLIER]);
	write_block(line, &request);
	seq.fetch_add(1, Ordering::Relaxed);
	match read_block(line, clk_hz) {
		ReadOutcome::Timeout => {
			debug!("timeout in WTX response");
			false
		}
		ReadOutcome::ChecksumMismatch => {
			debug!("checksum mismatch in WTX response");
			false
		}
		ReadOutcome::PpsHandled => {
			debug!("PPS instead of WTX response");
			false
		}
		ReadOutcome::Block(response) => {
			if response.pcb == 0xE3 {
				debug!("correct pcb");
				true
			} else {
				debug!("WTX response |{}", response);
				false
			}
		}
	}
}

/// Send `payload` as one I-block, or as a chain of them when it exceeds the
/// accepted information field size.
///
/// Every block but the last carries the more-data bit (PCB bit 5). After
/// each chained block the reader acknowledges with an R-block before the
/// next segment goes out; an error R-block triggers a retransmission, an
/// S-block is serviced in place. Returns the last block sent, retained by
/// the session for later retransmission requests.
pub fn write_chained(
	line: &dyn SerialLine,
	seq: &AtomicU32,
	accepted_size: &mut u8,
	nad: u8,
	pcb: u8,
	payload: &[u8],
	clk_hz: u32,
) -> Tpdu {
	let mut pcb = pcb;
	let mut sent = 0;
	loop {
		let block_size = (*accepted_size).max(1) as usize;
		let chunk = block_size.min(payload.len() - sent);
		let more = sent + chunk < payload.len();
		if more {
			trace!("set M-bit: accepted size {}", block_size);
			pcb |= 0x20;
		} else {
			pcb &= 0xDF;
		}
		adjust_sequence_bit(seq, &mut pcb);
		let tpdu = Tpdu::new(nad, pcb, &payload[sent..sent + chunk]);
		write_block(line, &tpdu);
		seq.fetch_add(1, Ordering::Relaxed);
		sent += chunk;
		if !more {
			return tpdu;
		}
		await_chaining_ack(line, seq, accepted_size, &tpdu, clk_hz);
	}
}

/// Wait for the reader's acknowledgement of a chained block.
///
/// R(ok) releases the next segment; an error R-block gets the block
/// retransmitted; an S-block is handled and ends the wait (the reader drives
/// the recovery from there); anything else is logged and skipped.
fn await_chaining_ack(
	line: &dyn SerialLine,
	seq: &AtomicU32,
	accepted_size: &mut u8,
	sent: &Tpdu,
	clk_hz: u32,
) {
	loop {
		match read_block(line, clk_hz) {
			ReadOutcome::Timeout => {
				debug!("timeout waiting for chaining ack");
				return;
			}
			ReadOutcome::ChecksumMismatch => {
				info!("checksum mismatch in chaining ack");
			}
			ReadOutcome::PpsHandled => {}
			ReadOutcome::Block(block) => match block.kind() {
				BlockKind::Receive => match classify_r_block(block.pcb) {
					RBlockKind::NoError => {
						trace!("chaining ack ok");
						return;
					}
					_ => {
						trace!("resend |{}", sent);
						write_block(line, sent);
						seq.fetch_add(1, Ordering::Relaxed);
					}
				},
				BlockKind::Supervisory => {
					let disposition = handle_s_block(line, seq, &block, accepted_size);
					debug!("s block while chaining: {:?}", disposition);
					return;
				}
				BlockKind::Information => {
					debug!("unexpected I block while chaining");
					return;
				}
			},
		}
	}
}

/// One T=1 relay session, torn down by the next reset edge.
pub struct Session {
	board: Board,
	channels: &'static Channels,
	link: HostChannel,
	pool: &'static dyn AlarmPool,
	seq: &'static AtomicU32,
	accepted_size: u8,
	bwt_alarm_us: u64,
	clk_hz: u32,
	last_response: Option<Tpdu>,
	buf: Vec<u8>,
}

impl Session {
	pub fn new(
		board: Board,
		channels: &'static Channels,
		config: &SessionConfig,
		seq: &'static AtomicU32,
		clk_hz: u32,
	) -> Self {
		Self {
			board,
			channels,
			link: HostChannel::new(board.host),
			pool: config.alarm_pool,
			seq,
			accepted_size: DEFAULT_IFS,
			// fire early enough to stretch the window before it closes
			bwt_alarm_us: config.atr.bwt_us * 3 / 4,
			clk_hz,
			last_response: None,
			buf: vec![0; APDU_BUFFER_LEN],
		}
	}

	/// Serve one block from the reader.
	pub fn serve_block(&mut self) {
		trace!("read command");
		let line = self.board.line;
		match read_block(line, self.clk_hz) {
			ReadOutcome::PpsHandled => info!("PPS completed"),
			ReadOutcome::Timeout => debug!("reading timeout"),
			ReadOutcome::ChecksumMismatch => {
				info!("checksum mismatch");
				let pcb = if self.seq.load(Ordering::Relaxed) % 2 == 0 {
					0x81
				} else {
					0x91
				};
				let reject = Tpdu::new(0x00, pcb, &[]);
				write_block(line, &reject);
				self.seq.fetch_add(1, Ordering::Relaxed);
			}
			ReadOutcome::Block(block) => match block.kind() {
				BlockKind::Supervisory => {
					let disposition =
						handle_s_block(line, self.seq, &block, &mut self.accepted_size);
					info!("s block: {:?}", disposition);
				}
				BlockKind::Receive => self.handle_r_block(&block),
				BlockKind::Information => self.relay_block(&block),
			},
		}
	}

	fn handle_r_block(&mut self, block: &Tpdu) {
		debug!("R BLOCK |{}", block);
		if classify_r_block(block.pcb) == RBlockKind::NoError {
			return;
		}
		match self.last_response.clone() {
			Some(mut resend) => {
				adjust_sequence_bit(self.seq, &mut resend.pcb);
				write_block(self.board.line, &resend);
				self.seq.fetch_add(1, Ordering::Relaxed);
				trace!("sequence counter: {}", self.seq.load(Ordering::Relaxed));
			}
			None => debug!("error R block with nothing to retransmit"),
		}
	}

	/// Relay one command I-block to the host and chain the response back.
	///
	/// The WTX alarm is armed before the host round-trip starts and
	/// cancelled as soon as the response is in. The alarm callback owns the
	/// UART only while the worker is parked in `read_apdu`, which is what
	/// makes its blocking I/O safe.
	fn relay_block(&mut self, block: &Tpdu) {
		let start = self.board.timer.now_us();
		let line = self.board.line;
		let interval = self.bwt_alarm_us;
		let seq = self.seq;
		let clk_hz = self.clk_hz;
		trace!("add alarm for bwt");
		let alarm = self.pool.add_alarm_us(
			interval,
			Box::new(move || {
				debug!("WTX after {} us", interval);
				send_wtx_request(line, seq, clk_hz);
				Some(interval)
			}),
		);

		let step_sent = self.board.timer.now_us();
		debug!("forward apdu[{}] to usb", block.inf.len());
		trace!("capdu |{}", block);
		self.link.write_apdu(&block.inf);
		let response_len = self.link.read_apdu(&mut self.buf, self.channels, self.clk_hz);
		let step_received = self.board.timer.now_us();
		debug!("received answer[{}] from usb", response_len);
		trace!("rapdu | {}", HexBytes(&self.buf[..response_len]));

		trace!("cancel bwt alarm");
		self.pool.cancel(alarm);

		let last = write_chained(
			line,
			self.seq,
			&mut self.accepted_size,
			block.nad,
			block.pcb,
			&self.buf[..response_len],
			self.clk_hz,
		);
		self.last_response = Some(last);
		let end = self.board.timer.now_us();
		self.link
			.write_measurement(end - start, step_sent - start, step_received - start);
	}
}

/// Worker-core entry for a T=1 session.
pub fn run_session(board: Board, channels: &'static Channels) -> ! {
	board.line.set_baudrate(DEFAULT_BAUD);
	trace!("take session config from queue");
	let config = channels.config.pop();
	relay::apply_session_atomics(&config);

	info!(
		"send ATR {} {}",
		config.uart_mode as u8, config.log_level
	);
	board.line.write_echoed(&config.atr.payload);

	let clk_hz = match config.uart_mode {
		UartMode::Synchronous => {
			let clk = board.timer.card_clk_hz();
			info!("measured clock {:.3} MHz", clk as f64 / 1_000_000.0);
			clk
		}
		UartMode::Asynchronous => {
			info!("card clock {:.3} MHz", config.clk_hz as f64 / 1_000_000.0);
			config.clk_hz
		}
	};

	// Specific-mode cards expect the ATR dividers right away, without a PPS.
	if (config.atr.f != 372 || config.atr.d != 1) && config.atr.ta2_present {
		let baud = board
			.line
			.set_baudrate(baudrate(config.atr.f, config.atr.d, clk_hz));
		info!("set early baudrate = {}", baud);
	}

	SEQUENCE.store(1, Ordering::Relaxed);
	let mut session = Session::new(board, channels, &config, &SEQUENCE, clk_hz);
	loop {
		session.serve_block();
	}
}
