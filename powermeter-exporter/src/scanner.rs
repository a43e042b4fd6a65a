//! Full bus scan, serialized across concurrent scrapes.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::exposition::Exposition;
use crate::reader::MeterReader;
use crate::registry::MeterConfig;
use crate::transport::RegisterTransport;

/// Owns the transport and the meter list.
///
/// The transport lock is held for a whole scan, so scrapes arriving while a
/// scan is running wait for it to finish and then run their own.
pub struct Scanner<T> {
    transport: Mutex<T>,
    meters: Vec<MeterConfig>,
    prefix: String,
}

/// Thread-safe reference to a scanner.
pub type SharedScanner<T> = Arc<Scanner<T>>;

impl<T: RegisterTransport> Scanner<T> {
    pub fn new(transport: T, meters: Vec<MeterConfig>, prefix: impl Into<String>) -> Self {
        Self {
            transport: Mutex::new(transport),
            meters,
            prefix: prefix.into(),
        }
    }

    /// Read every meter and render the exposition document.
    ///
    /// Unresponsive meters are left out of the document.
    pub async fn scrape(&self) -> String {
        let mut transport = self.transport.lock().await;
        let start = Instant::now();
        let mut exposition = Exposition::new(&self.prefix);
        let mut reader = MeterReader::new(&mut *transport);
        let mut responsive = 0usize;

        for meter in &self.meters {
            match reader.read(meter).await {
                Ok(reading) => {
                    debug!(
                        unit = meter.address,
                        device_type = meter.device_type.name(),
                        samples = reading.samples.len(),
                        elapsed_ms = reading.elapsed.as_millis() as u64,
                        "Meter read"
                    );
                    exposition.push_meter(&reading);
                    responsive += 1;
                }
                Err(e) => {
                    warn!(
                        unit = meter.address,
                        device_type = meter.device_type.name(),
                        error = %e,
                        "Meter unresponsive, skipped"
                    );
                }
            }
        }

        let total = start.elapsed();
        debug!(
            meters = self.meters.len(),
            responsive,
            elapsed_ms = total.as_millis() as u64,
            "Scan complete"
        );

        exposition.finish(total)
    }

    /// Close the transport, waiting for a running scan first.
    pub async fn close(&self) {
        let mut transport = self.transport.lock().await;
        if transport.close().await.is_ok() {
            info!("Transport closed");
        }
    }
}
