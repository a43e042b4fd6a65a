//! Register transport: the single handle to the shared Modbus bus.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio_modbus::client::{Client, Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ModbusConfig};
use crate::decode::{self, DecodeError};

/// A request answered by the device with an error.
///
/// Only the metrics covered by the request are affected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("Exception: {0}")]
    Exception(String),
    #[error("Short response: {0}")]
    Decode(#[from] DecodeError),
}

/// The bus did not deliver a response at all.
///
/// Further requests to the same device are pointless for this scan.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request to unit {unit} timed out after {attempts} attempt(s)")]
    Timeout { unit: u8, attempts: u32 },
    #[error("Read failed: {0}")]
    Read(String),
}

/// Outcome of a request that reached the device.
pub type ReadOutcome = Result<Vec<u16>, ReadError>;

/// Access to input registers of the devices on one bus.
pub trait RegisterTransport: Send + 'static {
    /// Read `count` input registers starting at `address` from unit `unit`.
    fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<ReadOutcome, TransportError>> + Send;

    /// Convert two registers to a single precision float the way the
    /// transport natively does.
    fn registers_to_f32(&self, words: &[u16]) -> Result<f32, DecodeError> {
        decode::float32_be(words)
    }

    /// Release the bus.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Modbus RTU/TCP transport backed by `tokio-modbus`.
pub struct ModbusTransport {
    ctx: Context,
    timeout: Duration,
    retries: u32,
}

impl ModbusTransport {
    /// Open the serial port or TCP connection.
    pub async fn connect(config: &ModbusConfig) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        // Unit 0 is a placeholder, every request selects its unit
        let slave = Slave(0);

        let ctx = match &config.connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?
                    .next()
                    .ok_or_else(|| {
                        TransportError::Connection(format!("No address for {}", host))
                    })?;

                let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
                    .map_err(|e| TransportError::Connection(e.to_string()))?;

                info!(%addr, "Connected to Modbus TCP");
                ctx
            }
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity.to_lowercase().as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits)
                    .timeout(timeout);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    TransportError::Connection(format!("Serial open failed: {}", e))
                })?;

                info!(port = %port, baud_rate, "Connected to Modbus RTU");
                rtu::attach_slave(serial, slave)
            }
        };

        Ok(Self {
            ctx,
            timeout,
            retries: config.retries,
        })
    }
}

/// Reject responses that do not carry exactly the requested registers.
fn check_word_count(words: Vec<u16>, count: u16) -> ReadOutcome {
    if words.len() != usize::from(count) {
        return Err(ReadError::Decode(DecodeError::WordCount {
            expected: usize::from(count),
            actual: words.len(),
        }));
    }
    Ok(words)
}

impl RegisterTransport for ModbusTransport {
    async fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<ReadOutcome, TransportError> {
        self.ctx.set_slave(Slave(unit));

        let attempts = self.retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.timeout, self.ctx.read_input_registers(address, count))
                .await
            {
                Ok(Ok(Ok(words))) => return Ok(check_word_count(words, count)),
                Ok(Ok(Err(exception))) => {
                    return Ok(Err(ReadError::Exception(format!("{:?}", exception))));
                }
                Ok(Err(e)) => {
                    debug!(unit, address, count, attempt, error = %e, "Modbus request failed");
                    last_error = Some(TransportError::Read(e.to_string()));
                }
                Err(_) => {
                    debug!(unit, address, count, attempt, "Modbus request timed out");
                    last_error = Some(TransportError::Timeout { unit, attempts });
                }
            }
        }

        Err(last_error.unwrap_or(TransportError::Timeout { unit, attempts }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.ctx.disconnect().await {
            Ok(()) => {
                info!("Modbus connection closed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to close Modbus connection");
                Err(TransportError::Connection(e.to_string()))
            }
        }
    }
}
