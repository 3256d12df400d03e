//! Reserved frame-byte singletons and fixed bus addresses.

/// This RCU's own bus address.
pub const RCU_ADDR: u8 = 0x14;

/// The heat pump's (bus master's) address.
pub const MASTER_ADDR: u8 = 0x24;

/// First byte of an address poll: `Address(0x00) Address(target_addr)`.
pub const POLL_LEAD: u8 = 0x00;

/// Ready-empty acknowledgement, sent as `Data(0x06)`.
pub const ACK: u8 = 0x06;

/// Request-to-send, sent as `Data(0x05)`.
pub const ENQ: u8 = 0x05;

/// Reject, sent as `Data(0x15)`.
pub const NAK: u8 = 0x15;

/// End-of-turn, sent as `Address(0x03)`.
pub const ETX: u8 = 0x03;

/// Leading byte of a master-originated data packet, sent as `Data(0xC0)`.
pub const CMD_DATA: u8 = 0xC0;

/// Separator byte preceding every parameter record inside a packet payload.
pub const RECORD_SEPARATOR: u8 = 0x00;

/// Default fallback width (in bytes) assumed for a parameter index absent
/// from the registry. Overridable per pump via the configuration document.
pub const DEFAULT_UNKNOWN_PARAMETER_WIDTH: u8 = 2;
