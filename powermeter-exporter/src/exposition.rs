//! Prometheus text exposition of one scan.

use std::fmt::Write;
use std::time::Duration;

use crate::catalog::Metric;
use crate::reader::MeterReading;

const MEAS_TIME: &str = "meas_time";
const MEAS_TIME_HELP: &str = "Time spent reading the meters, in seconds";

/// Builder for a single scrape response.
///
/// The HELP/TYPE preamble is written on construction, then each meter's
/// samples in the order they are pushed, then the total scan time.
pub struct Exposition {
    prefix: String,
    output: String,
}

impl Exposition {
    pub fn new(prefix: &str) -> Self {
        let mut exposition = Self {
            prefix: prefix.to_string(),
            output: String::new(),
        };
        exposition.write_preamble();
        exposition
    }

    fn name(&self, family: &str) -> String {
        if self.prefix.is_empty() {
            family.to_string()
        } else {
            format!("{}_{}", self.prefix, family)
        }
    }

    fn write_preamble(&mut self) {
        for metric in Metric::ALL {
            let name = self.name(metric.as_str());
            writeln!(self.output, "# HELP {} {}", name, metric.help()).ok();
            writeln!(self.output, "# TYPE {} {}", name, metric.kind()).ok();
        }

        let name = self.name(MEAS_TIME);
        writeln!(self.output, "# HELP {} {}", name, MEAS_TIME_HELP).ok();
        writeln!(self.output, "# TYPE {} gauge", name).ok();
    }

    /// Append a meter's samples followed by its timing line.
    pub fn push_meter(&mut self, reading: &MeterReading) {
        let label = format_address(reading.address);

        for sample in &reading.samples {
            let name = self.name(sample.metric.as_str());
            writeln!(
                self.output,
                "{}{{address=\"{}\"}} {}",
                name,
                label,
                format_value(sample.value)
            )
            .ok();
        }

        let name = self.name(MEAS_TIME);
        writeln!(
            self.output,
            "{}{{address=\"{}\"}} {}",
            name,
            label,
            format_value(reading.elapsed.as_secs_f64())
        )
        .ok();
    }

    /// Append the whole-scan timing line and return the document.
    pub fn finish(mut self, total: Duration) -> String {
        let name = self.name(MEAS_TIME);
        writeln!(self.output, "{} {}", name, format_value(total.as_secs_f64())).ok();
        self.output
    }
}

/// Zero-padded three digit unit address, as used in the `address` label.
pub fn format_address(address: u8) -> String {
    format!("{:03}", address)
}

/// Format a sample value for Prometheus exposition.
///
/// Shortest round-trip digits, switching to exponent notation when the
/// decimal exponent is below -4 or at least 21.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value.is_sign_positive() { "+Inf" } else { "-Inf" }.to_string();
    }

    let scientific = format!("{:e}", value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return format!("{}", value);
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return format!("{}", value);
    };

    if (-4..21).contains(&exponent) {
        format!("{}", value)
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.unsigned_abs())
    }
}
