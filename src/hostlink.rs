//! The opcoded message channel towards the host.
//!
//! Every frame is `opcode (1) | length (4) | payload (length)`. APDUs, ATR
//! updates, state queries, configuration changes, debug strings and
//! measurements all share the one pipe; the reader dispatches in-band and
//! only hands `APDU` payloads back to the protocol loops.

use core::cmp;

use hermit_sync::SpinMutex;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::atr::{AnswerToReset, Protocol};
use crate::config::MAX_ATR_SIZE;
use crate::drivers::HostPort;
use crate::logging::{self, HexBytes};
use crate::relay::{self, AtrUpdate, Channels, LogLevelUpdate, UartModeUpdate};

#[derive(TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum Opcode {
	Apdu = 0x00,
	Reset = 0x01,
	DebugMsg = 0x02,
	SendAtr = 0x03,
	Measurement = 0x04,
	RequestState = 0x05,
	SetUartMode = 0x06,
	SetLogLevel = 0x07,
}

/// Frames from the two cores interleave on the same pipe; serialize them.
static TX_LOCK: SpinMutex<()> = SpinMutex::new(());

/// Write one frame. The length field goes out as raw memory: host and device
/// must agree on byte order.
pub fn write_frame(port: &dyn HostPort, opcode: Opcode, payload: &[u8]) {
	let _guard = TX_LOCK.lock();
	port.write(&[u8::from(opcode)]);
	port.write(&(payload.len() as u32).to_ne_bytes());
	if !payload.is_empty() {
		port.write(payload);
	}
}

/// The device end of the host channel.
#[derive(Clone, Copy)]
pub struct HostChannel {
	port: &'static dyn HostPort,
}

impl HostChannel {
	pub const fn new(port: &'static dyn HostPort) -> Self {
		Self { port }
	}

	pub fn write_frame(&self, opcode: Opcode, payload: &[u8]) {
		write_frame(self.port, opcode, payload);
	}

	pub fn write_apdu(&self, payload: &[u8]) {
		self.write_frame(Opcode::Apdu, payload);
	}

	/// Latency report: total relay time, time to the host-send point and
	/// time to the host-receive point, all in microseconds.
	pub fn write_measurement(&self, total_us: u64, to_send_us: u64, to_recv_us: u64) {
		let report = format!("{}, {}, {}", total_us, to_send_us, to_recv_us);
		self.write_frame(Opcode::Measurement, report.as_bytes());
	}

	/// Ask the host for an ATR (empty `SENDATR` frame).
	pub fn request_atr(&self) {
		self.write_frame(Opcode::SendAtr, &[]);
	}

	/// Read one frame, storing at most `buf.len()` payload bytes and
	/// discarding the rest.
	fn read_frame_into(&self, buf: &mut [u8]) -> (u8, usize) {
		let mut opcode = [0u8; 1];
		self.port.read_exact(&mut opcode);
		let mut len_bytes = [0u8; 4];
		self.port.read_exact(&mut len_bytes);
		// raw memory on the wire, see write_frame
		let len = u32::from_ne_bytes(len_bytes) as usize;
		let stored = cmp::min(len, buf.len());
		self.port.read_exact(&mut buf[..stored]);
		if stored < len {
			warn!("host frame of {} bytes exceeds buffer, discarding {}", len, len - stored);
			let mut sink = [0u8; 32];
			let mut left = len - stored;
			while left > 0 {
				let chunk = cmp::min(left, sink.len());
				self.port.read_exact(&mut sink[..chunk]);
				left -= chunk;
			}
		}
		(opcode[0], stored)
	}

	/// Read frames until the host delivers a response APDU, servicing every
	/// control-plane opcode on the way. Returns the APDU length in `buf`.
	pub fn read_apdu(&self, buf: &mut [u8], channels: &Channels, clk_hz: u32) -> usize {
		loop {
			let (opcode, len) = self.read_frame_into(buf);
			debug!("host frame, opcode {:x}, len {:x}", opcode, len);
			match Opcode::try_from(opcode) {
				Ok(Opcode::Apdu) => return len,
				Ok(Opcode::SendAtr) => {
					debug!("new atr sent");
					let atr = AnswerToReset::parse(&buf[..len], clk_hz);
					if channels.atr_updates.try_push(AtrUpdate { atr }).is_err() {
						debug!("could not add atr to queue");
					}
				}
				Ok(Opcode::RequestState) => {
					self.write_frame(Opcode::RequestState, &[relay::current_state()]);
				}
				Ok(Opcode::SetUartMode) => self.handle_uart_mode(&buf[..len], channels),
				Ok(Opcode::SetLogLevel) => self.handle_log_level(&buf[..len], channels),
				Ok(other) => warn!("unexpected opcode {:?} from host", other),
				Err(_) => warn!("unknown opcode {:#04x} from host", opcode),
			}
		}
	}

	/// Read frames until the host delivers an ATR that selects a protocol.
	///
	/// Configuration opcodes are applied inline; anything else (including an
	/// unparseable ATR) returns `None` and the caller re-requests.
	pub fn read_atr(&self, clk_hz: u32) -> Option<AnswerToReset> {
		let mut buf = [0u8; MAX_ATR_SIZE];
		loop {
			let (opcode, len) = self.read_frame_into(&mut buf);
			debug!("host frame, opcode {:x}, len {:x}", opcode, len);
			match Opcode::try_from(opcode) {
				Ok(Opcode::SendAtr) => {
					info!("atr recv | {}", HexBytes(&buf[..len]));
					let atr = AnswerToReset::parse(&buf[..len], clk_hz);
					if atr.protocol == Protocol::Unknown {
						return None;
					}
					return Some(atr);
				}
				Ok(Opcode::RequestState) => {
					self.write_frame(Opcode::RequestState, &[relay::current_state()]);
					return None;
				}
				Ok(Opcode::SetUartMode) => {
					if len >= 1 {
						relay::apply_uart_mode(buf[0], 0);
					}
				}
				Ok(Opcode::SetLogLevel) => {
					if len >= 1 {
						logging::set_level_byte(buf[0]);
					}
				}
				_ => return None,
			}
		}
	}

	fn handle_uart_mode(&self, payload: &[u8], channels: &Channels) {
		if payload.len() < 5 {
			warn!("short SET_UARTMODE payload ({} bytes)", payload.len());
			return;
		}
		let mode = payload[0];
		// the clock travels big-endian, unlike the frame length
		let clk_hz = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
		let update = UartModeUpdate { mode, clk_hz };
		if channels.uart_mode_updates.try_push(update).is_err() {
			info!("could not add uartmode to queue");
		} else {
			relay::apply_uart_mode(mode, clk_hz);
		}
	}

	fn handle_log_level(&self, payload: &[u8], channels: &Channels) {
		let Some(&level) = payload.first() else {
			warn!("empty SET_LOGLEVEL payload");
			return;
		};
		let current = logging::current_level_byte();
		if level != current {
			if channels.log_level_updates.try_push(LogLevelUpdate { level }).is_err() {
				info!("could not add loglevel to queue");
			} else {
				info!("change loglevel from {} to {}", current, level);
			}
		}
		logging::set_level_byte(level);
	}
}
