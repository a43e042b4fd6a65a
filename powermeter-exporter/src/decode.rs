//! Register value decoders.
//!
//! Each decoder turns a fixed number of raw 16-bit input register words into
//! a physical value. Word order is always big-endian (first word is the most
//! significant one).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Expected {expected} registers, got {actual}")]
    WordCount { expected: usize, actual: usize },
}

/// Register encodings understood by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decoder {
    /// Unsigned 16-bit integer.
    T1,
    /// Signed 16-bit integer (two's complement).
    T2,
    /// Signed 32-bit integer, big-endian word order.
    T3,
    /// Unsigned 24-bit mantissa with signed 8-bit decimal exponent.
    T5,
    /// Signed 24-bit mantissa with signed 8-bit decimal exponent.
    T6,
    /// IEEE-754 single precision, big-endian word order.
    #[serde(rename = "float32_be")]
    Float32Be,
    /// IEEE-754 single precision converted by the transport itself.
    DelegatedFloat32,
}

impl Decoder {
    /// Number of consecutive registers this decoder consumes.
    pub fn word_count(self) -> u16 {
        match self {
            Decoder::T1 | Decoder::T2 => 1,
            Decoder::T3
            | Decoder::T5
            | Decoder::T6
            | Decoder::Float32Be
            | Decoder::DelegatedFloat32 => 2,
        }
    }

    /// Return the configuration name for this decoder.
    pub fn as_str(self) -> &'static str {
        match self {
            Decoder::T1 => "t1",
            Decoder::T2 => "t2",
            Decoder::T3 => "t3",
            Decoder::T5 => "t5",
            Decoder::T6 => "t6",
            Decoder::Float32Be => "float32_be",
            Decoder::DelegatedFloat32 => "delegated_float32",
        }
    }

    /// Decode `words` into an unscaled value.
    ///
    /// `DelegatedFloat32` decodes like `Float32Be` here; callers holding a
    /// transport should prefer its native conversion.
    pub fn decode(self, words: &[u16]) -> Result<f64, DecodeError> {
        check_len(words, self.word_count() as usize)?;

        let value = match self {
            Decoder::T1 => t1(words[0]),
            Decoder::T2 => t2(words[0]),
            Decoder::T3 => t3(words[0], words[1]),
            Decoder::T5 => t5(words[0], words[1]),
            Decoder::T6 => t6(words[0], words[1]),
            Decoder::Float32Be | Decoder::DelegatedFloat32 => {
                widen_f32(f32_from_words(words[0], words[1]))
            }
        };

        Ok(value)
    }
}

fn check_len(words: &[u16], expected: usize) -> Result<(), DecodeError> {
    if words.len() != expected {
        return Err(DecodeError::WordCount {
            expected,
            actual: words.len(),
        });
    }
    Ok(())
}

/// Unsigned 16-bit value.
pub fn t1(word: u16) -> f64 {
    f64::from(word)
}

/// Signed 16-bit value.
pub fn t2(word: u16) -> f64 {
    f64::from(word as i16)
}

/// Signed 32-bit value, high word first.
pub fn t3(high: u16, low: u16) -> f64 {
    let raw = (u32::from(high) << 16) | u32::from(low);
    f64::from(raw as i32)
}

/// Unsigned mantissa scaled by a signed decimal exponent.
///
/// The mantissa never carries a sign, so T5 cannot express negative values.
pub fn t5(high: u16, low: u16) -> f64 {
    let mantissa = (u32::from(high & 0x00FF) << 16) | u32::from(low);
    apply_exponent(f64::from(mantissa), exponent(high))
}

/// Signed 24-bit mantissa scaled by a signed decimal exponent.
pub fn t6(high: u16, low: u16) -> f64 {
    let mut mantissa = ((i32::from(high & 0x00FF)) << 16) | i32::from(low);
    if mantissa & 0x0080_0000 != 0 {
        mantissa -= 0x0100_0000;
    }
    apply_exponent(f64::from(mantissa), exponent(high))
}

/// IEEE-754 single precision value from two big-endian words.
pub fn float32_be(words: &[u16]) -> Result<f32, DecodeError> {
    check_len(words, 2)?;
    Ok(f32_from_words(words[0], words[1]))
}

/// Widen a single precision value through its shortest decimal form.
///
/// `230.1f32 as f64` is `230.10000610351562`; going through the decimal
/// representation publishes `230.1` instead.
pub fn widen_f32(value: f32) -> f64 {
    if !value.is_finite() {
        return f64::from(value);
    }
    value.to_string().parse().unwrap_or(f64::from(value))
}

fn f32_from_words(high: u16, low: u16) -> f32 {
    let [b0, b1] = high.to_be_bytes();
    let [b2, b3] = low.to_be_bytes();
    f32::from_be_bytes([b0, b1, b2, b3])
}

fn exponent(high: u16) -> i32 {
    i32::from((high >> 8) as u8 as i8)
}

fn apply_exponent(mantissa: f64, exp: i32) -> f64 {
    // Divide for negative exponents: 10^-1 is not exact in binary.
    if exp < 0 {
        mantissa / 10f64.powi(-exp)
    } else {
        mantissa * 10f64.powi(exp)
    }
}
