//! Modbus RTU framing: `[slave address][PDU][CRC16 little-endian]`.

use crate::error::{BridgeError, Result};

use super::constants::MAX_ADU_SIZE;
use super::pdu::ModbusPdu;

/// Modbus CRC16 (polynomial 0xA001, reflected).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build a complete RTU frame for a request PDU.
pub fn build_frame(slave_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(slave_id);
    frame.extend_from_slice(pdu.as_slice());

    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Parse and validate a received RTU frame, returning `(slave_id, pdu)`.
///
/// Checks minimum length, maximum ADU size and the trailing CRC; the
/// caller validates the slave echo and function code against the
/// request it issued.
pub fn parse_frame(data: &[u8]) -> Result<(u8, ModbusPdu)> {
    if data.len() < 4 {
        return Err(BridgeError::Protocol(format!(
            "RTU frame too short: {} bytes",
            data.len()
        )));
    }
    if data.len() > MAX_ADU_SIZE {
        return Err(BridgeError::Protocol(format!(
            "RTU frame too long: {} bytes",
            data.len()
        )));
    }

    let crc_pos = data.len() - 2;
    let received = u16::from_le_bytes([data[crc_pos], data[crc_pos + 1]]);
    let computed = crc16(&data[..crc_pos]);
    if received != computed {
        return Err(BridgeError::Protocol(format!(
            "CRC mismatch: received {received:#06x}, computed {computed:#06x}"
        )));
    }

    let slave_id = data[0];
    let pdu = ModbusPdu::from_slice(&data[1..crc_pos])?;
    Ok((slave_id, pdu))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::modbus::pdu::build_read_request;

    #[test]
    fn crc16_known_vector() {
        // FC03 read of 2 registers from address 0, slave 1
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(crc16(&data), 0x0BC4);
    }

    #[test]
    fn crc16_empty_input() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn build_then_parse_round_trip() {
        let pdu = build_read_request(0x03, 0x0000, 0x0002).unwrap();
        let frame = build_frame(1, &pdu);
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame[..6], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);

        let (slave, parsed) = parse_frame(&frame).unwrap();
        assert_eq!(slave, 1);
        assert_eq!(parsed.as_slice(), pdu.as_slice());
    }

    #[test]
    fn corrupt_crc_rejected() {
        let pdu = build_read_request(0x03, 0x0000, 0x0002).unwrap();
        let mut frame = build_frame(1, &pdu);
        frame[3] ^= 0xFF;

        let err = parse_frame(&frame).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn short_frame_rejected() {
        assert!(parse_frame(&[0x01, 0x03, 0x00]).is_err());
        assert!(parse_frame(&[]).is_err());
    }

    #[test]
    fn oversized_frame_rejected() {
        let data = vec![0x00; MAX_ADU_SIZE + 1];
        assert!(parse_frame(&data).is_err());
    }

    #[test]
    fn exception_frame_parses() {
        // Slave 1, FC03 exception 0x02 (illegal data address)
        let mut frame = vec![0x01, 0x83, 0x02];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let (slave, pdu) = parse_frame(&frame).unwrap();
        assert_eq!(slave, 1);
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));
    }
}
