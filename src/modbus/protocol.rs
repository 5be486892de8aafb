use bytes::{BufMut, Bytes, BytesMut};

pub const MBAP_HEADER_LEN: usize = 7;
pub const MAX_PDU_LEN: usize = 253;
pub const MAX_READ_QUANTITY: u16 = 125;
pub const MAX_WRITE_QUANTITY: u16 = 123;

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Modbus application protocol header preceding every TCP PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(raw: &[u8; MBAP_HEADER_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([raw[0], raw[1]]),
            protocol_id: u16::from_be_bytes([raw[2], raw[3]]),
            length: u16::from_be_bytes([raw[4], raw[5]]),
            unit_id: raw[6],
        }
    }

    /// Length of the PDU that follows, or `None` if the header is unusable.
    pub fn pdu_len(&self) -> Option<usize> {
        let len = usize::from(self.length).checked_sub(1)?;
        if self.protocol_id != 0 || len == 0 || len > MAX_PDU_LEN {
            return None;
        }
        Some(len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadHoldingRegisters { start: u16, quantity: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, values: Vec<u16> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    ReadHoldingRegisters(Vec<u16>),
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, quantity: u16 },
    Exception { function: u8, code: ExceptionCode },
}

impl ModbusRequest {
    /// Decodes a request PDU. Malformed requests come back as the exception
    /// response the server should send.
    pub fn decode(pdu: &[u8]) -> Result<Self, ModbusResponse> {
        let function = *pdu.first().ok_or(ModbusResponse::Exception {
            function: 0,
            code: ExceptionCode::IllegalFunction,
        })?;
        let exception = |code| ModbusResponse::Exception { function, code };
        let word = |i: usize| u16::from_be_bytes([pdu[i], pdu[i + 1]]);

        match function {
            FC_READ_HOLDING_REGISTERS => {
                if pdu.len() != 5 {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                let quantity = word(3);
                if quantity == 0 || quantity > MAX_READ_QUANTITY {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                Ok(ModbusRequest::ReadHoldingRegisters {
                    start: word(1),
                    quantity,
                })
            }
            FC_WRITE_SINGLE_REGISTER => {
                if pdu.len() != 5 {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                Ok(ModbusRequest::WriteSingleRegister {
                    address: word(1),
                    value: word(3),
                })
            }
            FC_WRITE_MULTIPLE_REGISTERS => {
                if pdu.len() < 6 {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                let quantity = word(3);
                let byte_count = usize::from(pdu[5]);
                if quantity == 0
                    || quantity > MAX_WRITE_QUANTITY
                    || byte_count != usize::from(quantity) * 2
                    || pdu.len() != 6 + byte_count
                {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                let values = (0..usize::from(quantity)).map(|i| word(6 + 2 * i)).collect();
                Ok(ModbusRequest::WriteMultipleRegisters {
                    start: word(1),
                    values,
                })
            }
            _ => Err(exception(ExceptionCode::IllegalFunction)),
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            ModbusRequest::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            ModbusRequest::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            ModbusRequest::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn encode_pdu(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function_code());
        match self {
            ModbusRequest::ReadHoldingRegisters { start, quantity } => {
                buf.put_u16(*start);
                buf.put_u16(*quantity);
            }
            ModbusRequest::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            ModbusRequest::WriteMultipleRegisters { start, values } => {
                buf.put_u16(*start);
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    buf.put_u16(*value);
                }
            }
        }
    }
}

impl ModbusResponse {
    pub fn encode_pdu(&self, buf: &mut BytesMut) {
        match self {
            ModbusResponse::ReadHoldingRegisters(values) => {
                buf.put_u8(FC_READ_HOLDING_REGISTERS);
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    buf.put_u16(*value);
                }
            }
            ModbusResponse::WriteSingleRegister { address, value } => {
                buf.put_u8(FC_WRITE_SINGLE_REGISTER);
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            ModbusResponse::WriteMultipleRegisters { start, quantity } => {
                buf.put_u8(FC_WRITE_MULTIPLE_REGISTERS);
                buf.put_u16(*start);
                buf.put_u16(*quantity);
            }
            ModbusResponse::Exception { function, code } => {
                buf.put_u8(function | 0x80);
                buf.put_u8(*code as u8);
            }
        }
    }
}

/// Wraps a PDU produced by `encode` into a complete MBAP frame.
pub fn encode_frame(transaction_id: u16, unit_id: u8, encode: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut pdu = BytesMut::with_capacity(MAX_PDU_LEN);
    encode(&mut pdu);

    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(&pdu);
    frame.freeze()
}
