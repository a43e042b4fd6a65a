//! Reading one meter through a register transport.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::catalog::{Metric, ReadBlock, RegisterMapEntry};
use crate::decode::{self, DecodeError, Decoder};
use crate::registry::{MeterConfig, ReadStrategy};
use crate::transport::{RegisterTransport, TransportError};

/// A decoded and scaled value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSample {
    pub metric: Metric,
    /// Modbus unit ID of the meter
    pub address: u8,
    pub value: f64,
}

/// Everything read from one meter during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    /// Modbus unit ID
    pub address: u8,
    /// Samples in register map order; failed reads are missing.
    pub samples: Vec<DecodedSample>,
    /// Wall time spent on the meter's requests
    pub elapsed: Duration,
}

/// Reads meters over a borrowed transport.
pub struct MeterReader<'a, T> {
    transport: &'a mut T,
}

impl<'a, T: RegisterTransport> MeterReader<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }

    /// Read every active register of `meter`.
    ///
    /// Failed requests only drop the metrics they cover. A transport error
    /// aborts the meter and is returned to the caller.
    pub async fn read(&mut self, meter: &MeterConfig) -> Result<MeterReading, TransportError> {
        let start = Instant::now();
        let mut values = vec![None; meter.registers.len()];

        match meter.strategy {
            ReadStrategy::Batched(plan) => self.read_batched(meter, plan, &mut values).await?,
            ReadStrategy::PerEntry => {
                let all: Vec<usize> = (0..meter.registers.len()).collect();
                self.read_each(meter, &all, &mut values).await?;
            }
        }

        let samples = meter
            .registers
            .iter()
            .zip(values)
            .filter_map(|(entry, value)| {
                value.map(|value| DecodedSample {
                    metric: entry.metric,
                    address: meter.address,
                    value,
                })
            })
            .collect();

        Ok(MeterReading {
            address: meter.address,
            samples,
            elapsed: start.elapsed(),
        })
    }

    async fn read_batched(
        &mut self,
        meter: &MeterConfig,
        plan: &[ReadBlock],
        values: &mut [Option<f64>],
    ) -> Result<(), TransportError> {
        let mut covered = vec![false; meter.registers.len()];

        for block in plan {
            let members: Vec<usize> = meter
                .registers
                .iter()
                .enumerate()
                .filter(|(i, entry)| !covered[*i] && block.contains(entry))
                .map(|(i, _)| i)
                .collect();

            if members.is_empty() {
                continue;
            }
            for &i in &members {
                covered[i] = true;
            }

            let words = match self
                .transport
                .read_input_registers(meter.address, block.address, block.count)
                .await?
            {
                Ok(words) => words,
                Err(e) => {
                    warn!(
                        unit = meter.address,
                        block = block.address,
                        count = block.count,
                        error = %e,
                        "Block read failed"
                    );
                    continue;
                }
            };

            for i in members {
                let entry = &meter.registers[i];
                let offset = usize::from(entry.address - block.address);
                let slice = words
                    .get(offset..offset + usize::from(entry.words))
                    .ok_or(DecodeError::WordCount {
                        expected: offset + usize::from(entry.words),
                        actual: words.len(),
                    });

                values[i] = self.decode_logged(meter.address, entry, slice);
            }
        }

        let leftovers: Vec<usize> = covered
            .iter()
            .enumerate()
            .filter(|(_, covered)| !**covered)
            .map(|(i, _)| i)
            .collect();

        self.read_each(meter, &leftovers, values).await
    }

    async fn read_each(
        &mut self,
        meter: &MeterConfig,
        indices: &[usize],
        values: &mut [Option<f64>],
    ) -> Result<(), TransportError> {
        for &i in indices {
            let entry = &meter.registers[i];

            match self
                .transport
                .read_input_registers(meter.address, entry.address, entry.words)
                .await?
            {
                Ok(words) => {
                    values[i] = self.decode_logged(meter.address, entry, Ok(words.as_slice()));
                }
                Err(e) => {
                    warn!(
                        unit = meter.address,
                        metric = %entry.metric,
                        register = entry.address,
                        error = %e,
                        "Register read failed"
                    );
                }
            }
        }

        Ok(())
    }

    fn decode_logged(
        &self,
        unit: u8,
        entry: &RegisterMapEntry,
        words: Result<&[u16], DecodeError>,
    ) -> Option<f64> {
        match words.and_then(|words| self.decode(entry, words)) {
            Ok(value) => {
                debug!(unit, metric = %entry.metric, value, "Decoded register");
                Some(value)
            }
            Err(e) => {
                warn!(
                    unit,
                    metric = %entry.metric,
                    register = entry.address,
                    error = %e,
                    "Failed to decode register"
                );
                None
            }
        }
    }

    fn decode(&self, entry: &RegisterMapEntry, words: &[u16]) -> Result<f64, DecodeError> {
        let raw = match entry.decoder {
            Decoder::DelegatedFloat32 => {
                if words.len() != usize::from(entry.words) {
                    return Err(DecodeError::WordCount {
                        expected: usize::from(entry.words),
                        actual: words.len(),
                    });
                }
                decode::widen_f32(self.transport.registers_to_f32(words)?)
            }
            decoder => decoder.decode(words)?,
        };

        Ok(apply_scale(raw, entry.scale))
    }
}

/// Apply a register map scale factor.
///
/// Fractional factors with an integral reciprocal (0.1, 0.001) divide, so
/// `3 * 0.1` publishes `0.3`.
pub fn apply_scale(value: f64, scale: f64) -> f64 {
    let inverse = scale.recip();
    if scale.abs() < 1.0 && inverse.fract() == 0.0 {
        value / inverse
    } else {
        value * scale
    }
}
