//! Modbus PDU construction and response decoding.
//!
//! Uses a fixed-size stack array to avoid heap allocation on the hot
//! polling path.

use crate::error::{BridgeError, Result};

use super::constants::{
    EXCEPTION_BIT, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MAX_READ_BITS,
    MAX_READ_REGISTERS,
};

/// Protocol Data Unit with stack-allocated fixed buffer.
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(BridgeError::Protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(BridgeError::Protocol("PDU buffer full".to_string()));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Get immutable data slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get current length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_BIT != 0)
            .unwrap_or(false)
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a read request PDU (FC01/FC02/FC03).
pub fn build_read_request(function: u8, start: u16, count: u16) -> Result<ModbusPdu> {
    let limit = match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => MAX_READ_BITS,
        FC_READ_HOLDING_REGISTERS => MAX_READ_REGISTERS,
        other => {
            return Err(BridgeError::Protocol(format!(
                "Unsupported read function code: {other:#04x}"
            )));
        }
    };
    if count == 0 || count > limit {
        return Err(BridgeError::InvalidPoint(format!(
            "Read count {count} outside 1..={limit} for function {function:#04x}"
        )));
    }

    let mut pdu = ModbusPdu::new();
    pdu.push(function)?;
    pdu.push_u16(start)?;
    pdu.push_u16(count)?;
    Ok(pdu)
}

/// Build an FC05 Write Single Coil request.
///
/// The on value on the wire is 0xFF00; off is 0x0000.
pub fn build_write_coil_request(offset: u16, value: bool) -> Result<ModbusPdu> {
    let mut pdu = ModbusPdu::new();
    pdu.push(FC_WRITE_SINGLE_COIL)?;
    pdu.push_u16(offset)?;
    pdu.push_u16(if value { 0xFF00 } else { 0x0000 })?;
    Ok(pdu)
}

/// Build an FC06 Write Single Register request.
pub fn build_write_register_request(offset: u16, value: u16) -> Result<ModbusPdu> {
    let mut pdu = ModbusPdu::new();
    pdu.push(FC_WRITE_SINGLE_REGISTER)?;
    pdu.push_u16(offset)?;
    pdu.push_u16(value)?;
    Ok(pdu)
}

/// Expected response PDU length for a request, exception replies aside.
pub fn expected_response_len(function: u8, count: u16) -> Result<usize> {
    match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
            Ok(1 + 1 + (count as usize).div_ceil(8))
        }
        FC_READ_HOLDING_REGISTERS => Ok(1 + 1 + count as usize * 2),
        // Write echoes: function + address + value
        FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER => Ok(5),
        other => Err(BridgeError::Protocol(format!(
            "Unsupported function code: {other:#04x}"
        ))),
    }
}

/// Decode an FC01/FC02 response into `count` bit values.
pub fn decode_bits(pdu: &ModbusPdu, count: u16) -> Result<Vec<bool>> {
    let data = pdu.as_slice();
    if data.len() < 2 {
        return Err(BridgeError::Protocol("Bit response too short".to_string()));
    }

    let byte_count = data[1] as usize;
    if byte_count != (count as usize).div_ceil(8) || data.len() != 2 + byte_count {
        return Err(BridgeError::Protocol(format!(
            "Bit response byte count mismatch: declared {byte_count}, pdu len {}",
            data.len()
        )));
    }

    let mut bits = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let byte = data[2 + i / 8];
        bits.push(byte & (1 << (i % 8)) != 0);
    }
    Ok(bits)
}

/// Decode an FC03 response into `count` register values.
pub fn decode_registers(pdu: &ModbusPdu, count: u16) -> Result<Vec<u16>> {
    let data = pdu.as_slice();
    if data.len() < 2 {
        return Err(BridgeError::Protocol(
            "Register response too short".to_string(),
        ));
    }

    let byte_count = data[1] as usize;
    if byte_count != count as usize * 2 || data.len() != 2 + byte_count {
        return Err(BridgeError::Protocol(format!(
            "Register response byte count mismatch: declared {byte_count}, expected {}",
            count * 2
        )));
    }

    let mut registers = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let idx = 2 + i * 2;
        registers.push(u16::from_be_bytes([data[idx], data[idx + 1]]));
    }
    Ok(registers)
}
