//! Modbus RTU protocol constants.
//!
//! Derived from the official specification: the RS485 ADU limit of 256
//! bytes leaves 253 bytes of PDU after the slave address and CRC.

/// Maximum PDU (Protocol Data Unit) size per Modbus specification.
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum RTU ADU size: slave address + PDU + CRC16.
pub const MAX_ADU_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Response buffer size with safety margin over the max ADU.
pub const RESPONSE_BUFFER_SIZE: usize = 512;

/// Maximum bits for FC01/FC02 (Read Coils / Read Discrete Inputs).
///
/// Response PDU: function(1) + byte count(1) + ceil(N/8) <= 253,
/// spec rounds to 2000.
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum registers for FC03 (Read Holding Registers).
///
/// Response PDU: function(1) + byte count(1) + 2N <= 253 gives N <= 125.
pub const MAX_READ_REGISTERS: u16 = 125;

// Function codes used on this bus
pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// High bit set on the echoed function code marks an exception reply.
pub const EXCEPTION_BIT: u8 = 0x80;
