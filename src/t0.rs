//! T=0 byte transmission protocol.
//!
//! T=0 has no block structure: the reader clocks out a five-byte header, the
//! card answers with procedure bytes and data, and every exchange ends in a
//! two-byte status word. Since a response APDU only fits the wire when the
//! reader asked for exactly that much, oversize responses are parked in a
//! cache and served to the GET RESPONSE command the reader issues next.

use alloc::vec::Vec;

use crate::atr::{baudrate, di_value, fi_value};
use crate::config::{
	APDU_BUFFER_LEN, CLK_DEFAULT_HZ, HEADER_LEN, PPS_BYTE, PPS_LEN, SW_LEN,
};
use crate::drivers::Board;
use crate::hostlink::HostChannel;
use crate::logging::HexBytes;
use crate::relay::{self, Channels, SessionConfig, UartMode};

/// INS of the GET RESPONSE command that empties the response cache.
const INS_GET_RESPONSE: u8 = 0xC0;

/// ISO 7816-3 APDU cases, from the reader's point of view.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ApduCase {
	/// Header only, SW back.
	Case1,
	/// Header, data and SW back.
	Case2,
	/// Header plus command data, SW back.
	Case3,
	/// Command data in, response data out; on this wire it behaves like
	/// case 3 and the response travels through GET RESPONSE.
	Case4,
}

/// Classify a command header by its instruction byte, following the
/// GSM 11.11 / ETSI TS 102 221 command set.
pub fn classify(header: &[u8; HEADER_LEN]) -> Option<ApduCase> {
	let ins = header[1];
	let case = match ins {
		// INVALIDATE, REHABILITATE, SLEEP
		0x04 | 0x44 | 0xFA => ApduCase::Case1,
		// FETCH, GET CHALLENGE, MANAGE CHANNEL, READ BINARY, READ RECORD,
		// GET RESPONSE, GET DATA, STATUS
		0x12 | 0x84 | 0x70 | 0xB0 | 0xB2 | 0xC0 | 0xCA | 0xF2 => ApduCase::Case2,
		// TERMINAL PROFILE, TERMINAL RESPONSE, VERIFY, CHANGE PIN,
		// DISABLE PIN, ENABLE PIN, UNBLOCK PIN, UPDATE BINARY, UPDATE RECORD
		0x10 | 0x14 | 0x20 | 0x24 | 0x26 | 0x28 | 0x2C | 0xD6 | 0xDC => ApduCase::Case3,
		// INCREASE, RUN GSM ALGORITHM / AUTHENTICATE, SEEK, SELECT, ENVELOPE
		0x32 | 0x88 | 0xA2 | 0xA4 | 0xC2 => ApduCase::Case4,
		_ => return None,
	};
	Some(case)
}

/// One T=0 relay session, torn down by the next reset edge.
pub struct Session {
	board: Board,
	channels: &'static Channels,
	link: HostChannel,
	clk_hz: u32,
	uart_mode: UartMode,
	/// The last oversize response, complete with its status word, waiting
	/// for a GET RESPONSE.
	cache: Option<Vec<u8>>,
}

impl Session {
	pub fn new(
		board: Board,
		channels: &'static Channels,
		config: &SessionConfig,
		clk_hz: u32,
	) -> Self {
		Self {
			board,
			channels,
			link: HostChannel::new(board.host),
			clk_hz,
			uart_mode: config.uart_mode,
			cache: None,
		}
	}

	/// Read the PPS the reader opens with, echo it and switch the baud rate
	/// to the negotiated dividers.
	pub fn exchange_pps(&mut self) {
		let line = self.board.line;
		let mut pps = [0u8; PPS_LEN];
		debug!("read PPS");
		line.read_exact(&mut pps);
		if pps[0] != PPS_BYTE {
			info!("ERROR when receiving pps");
			return;
		}
		line.write_echoed(&pps);
		let f = fi_value(pps[2]);
		let d = di_value(pps[2]);
		line.wait_tx_complete();
		let baud = match self.uart_mode {
			UartMode::Synchronous => baudrate(f, d, CLK_DEFAULT_HZ),
			UartMode::Asynchronous => baudrate(f, d, self.clk_hz),
		};
		let baud = line.set_baudrate(baud);
		info!("set baudrate = {}", baud);
	}

	/// Serve one command from the reader.
	pub fn serve_command(&mut self, buf: &mut [u8]) {
		let line = self.board.line;
		trace!("read command");
		line.read_exact(&mut buf[..HEADER_LEN]);
		let start = self.board.timer.now_us();

		let header: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().unwrap_or_default();
		let case = classify(&header);
		let p3 = header[4];
		let proc_byte = header[1];
		debug!("apdu case {:?}", case);

		let mut apdu_len = HEADER_LEN;
		// expected reply length, status word included
		let mut le = SW_LEN;
		match case {
			Some(ApduCase::Case1) => {}
			Some(ApduCase::Case2) => {
				le += p3 as usize;
				if p3 == 0 {
					le += 256;
				}
			}
			Some(ApduCase::Case3) | Some(ApduCase::Case4) => {
				let lc = p3 as usize;
				if lc > 0 {
					line.write_echoed(&[proc_byte]);
					line.read_exact(&mut buf[HEADER_LEN..HEADER_LEN + lc]);
					apdu_len += lc;
				}
			}
			None => info!("cannot determine case for apdu"),
		}

		if let Some(cached) = self.cache.as_deref() {
			if proc_byte == INS_GET_RESPONSE {
				line.write_echoed(&[proc_byte]);
				line.write_echoed(cached);
				return;
			}
		}
		self.cache = None;

		let step_sent = self.board.timer.now_us();
		debug!("forward apdu[{}] to usb", apdu_len);
		trace!("capdu | {}", HexBytes(&buf[..apdu_len]));
		self.link.write_apdu(&buf[..apdu_len]);

		let response_len = self.link.read_apdu(buf, self.channels, self.clk_hz);
		let step_received = self.board.timer.now_us();
		debug!("received answer[{}] from usb", response_len);
		trace!("rapdu | {}", HexBytes(&buf[..response_len]));

		if response_len == SW_LEN {
			line.write_echoed(&buf[..response_len]);
		} else if response_len == le {
			line.write_echoed(&[proc_byte]);
			line.write_echoed(&buf[..response_len]);
		} else {
			// does not fit what the reader asked for: cache it and steer
			// the reader towards GET RESPONSE
			self.cache = Some(buf[..response_len].to_vec());
			let sw1 = if response_len > le { 0x61 } else { 0x6C };
			let sw2 = response_len.saturating_sub(SW_LEN) as u8;
			line.write_echoed(&[sw1, sw2]);
		}

		let end = self.board.timer.now_us();
		self.link
			.write_measurement(end - start, step_sent - start, step_received - start);
	}
}

/// Worker-core entry for a T=0 session.
pub fn run_session(board: Board, channels: &'static Channels) -> ! {
	trace!("take session config from queue");
	let config = channels.config.pop();
	relay::apply_session_atomics(&config);

	let clk_hz = match config.uart_mode {
		UartMode::Synchronous => {
			let clk = board.timer.card_clk_hz();
			info!("measured clock {:.3} MHz", clk as f64 / 1_000_000.0);
			clk
		}
		UartMode::Asynchronous => {
			info!("current clk is {:.3} MHz", config.clk_hz as f64 / 1_000_000.0);
			config.clk_hz
		}
	};

	board.line.set_baudrate(baudrate(372, 1, CLK_DEFAULT_HZ));

	debug!("send ATR");
	board.line.write_echoed(&config.atr.payload);

	let mut session = Session::new(board, channels, &config, clk_hz);
	session.exchange_pps();

	let mut buf = vec![0u8; APDU_BUFFER_LEN];
	loop {
		session.serve_command(&mut buf);
	}
}
