//! Compile-time tunables of the relay engine.

/// Largest command or response APDU the relay buffers.
pub const APDU_BUFFER_LEN: usize = 1024;

/// Longest Answer-To-Reset permitted by ISO/IEC 7816-3.
pub const MAX_ATR_SIZE: usize = 34;

/// T=0 command header: CLA, INS, P1, P2, P3.
pub const HEADER_LEN: usize = 5;

/// Status word SW1 SW2.
pub const SW_LEN: usize = 2;

/// PPS exchange: PPSS, PPS0, PPS1, PCK.
pub const PPS_LEN: usize = 4;

/// First byte of a PPS request (PPSS).
pub const PPS_BYTE: u8 = 0xFF;

/// Largest information field a T=1 block may carry.
pub const MAX_INF_LEN: usize = 254;

/// Information field size before IFS negotiation.
pub const DEFAULT_IFS: u8 = 32;

/// Card UART baud rate before any PPS, at the 372/1 default divider.
pub const DEFAULT_BAUD: u32 = 9600;

/// Nominal reader clock when none has been measured or configured.
pub const CLK_DEFAULT_HZ: u32 = 3_571_200;

/// Configured fixed clock at boot, before any `SET_UARTMODE` message.
pub const BOOT_CONFIGURED_CLK_HZ: u32 = 4_764_000;

/// Per-byte receive window on the card UART during a T=1 block read.
pub const UART_READ_TIMEOUT_US: u64 = 1_200_000;

/// Multiplier sent in the INF byte of an S(WTX request) block.
pub const WAITING_TIME_EXTENSION_MULTIPLIER: u8 = 0x02;

/// Polling interval while watching the reset line.
pub const RESET_POLL_INTERVAL_US: u64 = 100;

/// Grace period between the first valid ATR and watching the reset line.
pub const RESET_SETTLE_US: u64 = 100_000;
