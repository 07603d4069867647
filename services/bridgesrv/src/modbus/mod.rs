//! Modbus RTU wire layer: PDU construction, framing and CRC.

pub mod constants;
pub mod frame;
pub mod pdu;
