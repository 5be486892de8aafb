use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};

use super::protocol::{
    encode_frame, ExceptionCode, MbapHeader, ModbusRequest, ModbusResponse, MBAP_HEADER_LEN,
};
use super::store::{HoldingRegisterBank, RegisterStore};
use crate::services::shutdown::Shutdown;
use crate::utils::error::SimulationError;

/// Modbus TCP front end for a [`HoldingRegisterBank`].
///
/// Answers function codes 0x03, 0x06 and 0x10 for any unit id.
pub struct ModbusTcpServer {
    listener: TcpListener,
    bank: Arc<HoldingRegisterBank>,
    local_addr: SocketAddr,
}

impl ModbusTcpServer {
    pub async fn bind(address: &str, bank: Arc<HoldingRegisterBank>) -> Result<Self, SimulationError> {
        let listener = TcpListener::bind(address).await.map_err(|e| SimulationError::BindError {
            address: address.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;
        info!("🔌 Modbus TCP server listening on {}", local_addr);

        Ok(Self {
            listener,
            bank,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        let mut connections = JoinSet::new();

        while !shutdown.is_triggered() {
            tokio::select! {
                _ = shutdown.triggered() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("🔗 Modbus client connected: {}", peer);
                        connections.spawn(serve_connection(stream, peer, self.bank.clone()));
                    }
                    Err(e) => {
                        error!("Failed to accept Modbus connection: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        info!("✅ Modbus TCP server on {} stopped", self.local_addr);
    }
}

async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, bank: Arc<HoldingRegisterBank>) {
    loop {
        let mut raw_header = [0u8; MBAP_HEADER_LEN];
        if let Err(e) = stream.read_exact(&mut raw_header).await {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                warn!("❌ Modbus read from {} failed: {}", peer, e);
            }
            break;
        }

        let header = MbapHeader::parse(&raw_header);
        let Some(pdu_len) = header.pdu_len() else {
            warn!("❌ Malformed MBAP header from {}: {}", peer, hex::encode(raw_header));
            break;
        };

        let mut pdu = vec![0u8; pdu_len];
        if let Err(e) = stream.read_exact(&mut pdu).await {
            warn!("❌ Truncated Modbus request from {}: {}", peer, e);
            break;
        }
        debug!("📥 Modbus request from {}: {}", peer, hex::encode(&pdu));

        let response = match ModbusRequest::decode(&pdu) {
            Ok(request) => execute(&bank, request).await,
            Err(exception) => exception,
        };
        let frame = encode_frame(header.transaction_id, header.unit_id, |buf| {
            response.encode_pdu(buf)
        });
        debug!("📤 Modbus response to {}: {}", peer, hex::encode(&frame));

        if let Err(e) = stream.write_all(&frame).await {
            warn!("❌ Modbus write to {} failed: {}", peer, e);
            break;
        }
    }
    info!("🔌 Modbus client {} disconnected", peer);
}

async fn execute(bank: &HoldingRegisterBank, request: ModbusRequest) -> ModbusResponse {
    let function = request.function_code();
    let result = match request {
        ModbusRequest::ReadHoldingRegisters { start, quantity } => bank
            .read_holding_registers(start, quantity)
            .await
            .map(ModbusResponse::ReadHoldingRegisters),
        ModbusRequest::WriteSingleRegister { address, value } => bank
            .write_holding_register(address, value)
            .await
            .map(|_| ModbusResponse::WriteSingleRegister { address, value }),
        ModbusRequest::WriteMultipleRegisters { start, values } => bank
            .write_holding_registers(start, &values)
            .await
            .map(|_| ModbusResponse::WriteMultipleRegisters {
                start,
                quantity: values.len() as u16,
            }),
    };

    result.unwrap_or_else(|e| {
        let code = match e {
            SimulationError::IllegalAddress(_) => ExceptionCode::IllegalDataAddress,
            _ => ExceptionCode::ServerDeviceFailure,
        };
        ModbusResponse::Exception { function, code }
    })
}
