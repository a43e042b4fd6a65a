//! Prometheus exporter for Modbus power meters.
//!
//! Every scrape of the metrics endpoint reads all configured meters over one
//! shared Modbus transport, decodes their input registers and renders the
//! result in the Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   Modbus bus    │<────│     Scanner     │<────│   HTTP Server   │
//! │  (RTU or TCP)   │     │ (reader, lock)  │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! A scan holds the transport for its whole duration; a scrape arriving in
//! the meantime waits for it.
//!
//! # Usage
//!
//! ```bash
//! powermeter-exporter --config /etc/opt/powermeter.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod catalog;
pub mod config;
pub mod decode;
pub mod exposition;
pub mod http;
pub mod reader;
pub mod registry;
pub mod scanner;
pub mod transport;

pub use catalog::{Metric, ReadBlock, RegisterMapEntry};
pub use config::ExporterConfig;
pub use decode::Decoder;
pub use http::HttpServer;
pub use reader::{DecodedSample, MeterReader, MeterReading};
pub use registry::{DeviceType, MeterConfig};
pub use scanner::{Scanner, SharedScanner};
pub use transport::{ModbusTransport, ReadError, RegisterTransport, TransportError};
