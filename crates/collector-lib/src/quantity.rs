//! Kubernetes resource quantity parsing
//!
//! Quantities such as `250m`, `1.5Gi` or `12e3` are parsed into an exact
//! decimal representation so that rounding matches the API server: values are
//! scaled and rounded up, never truncated.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;
use tracing::warn;

/// Significant digits beyond which a quantity is rejected
const MAX_DIGITS: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown suffix in quantity {0:?}")]
    UnknownSuffix(String),

    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

/// Exact quantity: `digits * 10^exp10 * 2^binary`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedQuantity {
    digits: i128,
    exp10: i32,
    binary: u32,
}

impl ParsedQuantity {
    pub fn parse(raw: &str) -> Result<Self, QuantityError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, unsigned) = match raw.as_bytes()[0] {
            b'-' => (true, &raw[1..]),
            b'+' => (false, &raw[1..]),
            _ => (false, raw),
        };

        let number_end = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_end);

        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(QuantityError::InvalidNumber(raw.to_string()));
        }
        if fraction.contains('.') {
            return Err(QuantityError::InvalidNumber(raw.to_string()));
        }

        let significant = format!("{whole}{fraction}");
        let significant = significant.trim_start_matches('0');
        if significant.len() > MAX_DIGITS {
            return Err(QuantityError::Overflow(raw.to_string()));
        }

        let mut digits: i128 = if significant.is_empty() {
            0
        } else {
            significant
                .parse()
                .map_err(|_| QuantityError::InvalidNumber(raw.to_string()))?
        };
        if negative {
            digits = -digits;
        }

        let (suffix_exp10, binary) = parse_suffix(suffix)
            .ok_or_else(|| QuantityError::UnknownSuffix(raw.to_string()))?;

        let exp10 = suffix_exp10
            .checked_sub(fraction.len() as i32)
            .ok_or_else(|| QuantityError::Overflow(raw.to_string()))?;

        Ok(Self {
            digits,
            exp10,
            binary,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.digits == 0
    }

    /// Value in units of `10^scale`, rounded up. `None` when out of range.
    pub fn scaled_ceil(&self, scale: i32) -> Option<i128> {
        let mut n = self.digits;
        for _ in 0..self.binary {
            n = n.checked_mul(2)?;
        }

        let exp = self.exp10.checked_sub(scale)?;
        if exp >= 0 {
            n.checked_mul(10i128.checked_pow(exp as u32)?)
        } else {
            let Some(divisor) = 10i128.checked_pow(exp.unsigned_abs()) else {
                // Divisor exceeds any representable value
                return Some(if n > 0 { 1 } else { 0 });
            };
            let quotient = n / divisor;
            if n % divisor != 0 && n > 0 {
                Some(quotient + 1)
            } else {
                Some(quotient)
            }
        }
    }

    /// Whole units, rounded up
    pub fn value(&self) -> Option<i128> {
        self.scaled_ceil(0)
    }

    /// Thousandths of a unit, rounded up
    pub fn milli_value(&self) -> Option<i128> {
        self.scaled_ceil(-3)
    }
}

/// Returns the decimal exponent and binary exponent for a suffix
fn parse_suffix(suffix: &str) -> Option<(i32, u32)> {
    let parsed = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 10),
        "Mi" => (0, 20),
        "Gi" => (0, 30),
        "Ti" => (0, 40),
        "Pi" => (0, 50),
        "Ei" => (0, 60),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            (exponent.parse::<i32>().ok()?, 0)
        }
    };
    Some(parsed)
}

fn parse_logged(quantity: &Quantity) -> Option<ParsedQuantity> {
    match ParsedQuantity::parse(&quantity.0) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(quantity = %quantity.0, error = %e, "Skipping unparseable quantity");
            None
        }
    }
}

/// Millicores of a CPU quantity; `None` when zero or unparseable
pub fn millis(quantity: &Quantity) -> Option<i128> {
    parse_logged(quantity)
        .filter(|q| !q.is_zero())
        .and_then(|q| q.milli_value())
}

/// Whole units of a quantity; `None` when zero or unparseable
pub fn units(quantity: &Quantity) -> Option<i128> {
    parse_logged(quantity)
        .filter(|q| !q.is_zero())
        .and_then(|q| q.value())
}

/// CPU quantity as fractional cores
pub fn cores(quantity: &Quantity) -> Option<f64> {
    millis(quantity).map(|m| m as f64 / 1000.0)
}

/// Memory or storage quantity as bytes
pub fn bytes(quantity: &Quantity) -> Option<f64> {
    units(quantity).map(|v| v as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(raw: &str) -> Quantity {
        Quantity(raw.to_string())
    }

    #[test]
    fn test_parse_cpu_quantities() {
        assert_eq!(cores(&q("250m")), Some(0.25));
        assert_eq!(cores(&q("2")), Some(2.0));
        assert_eq!(cores(&q("1.5")), Some(1.5));
        assert_eq!(cores(&q("0.1")), Some(0.1));
    }

    #[test]
    fn test_nanocores_round_up_to_millicores() {
        // metrics-server reports CPU in nanocores
        assert_eq!(millis(&q("123456789n")), Some(124));
        assert_eq!(millis(&q("1n")), Some(1));
        assert_eq!(millis(&q("5000000n")), Some(5));
    }

    #[test]
    fn test_parse_memory_quantities() {
        assert_eq!(bytes(&q("128Mi")), Some(134_217_728.0));
        assert_eq!(bytes(&q("1Gi")), Some(1_073_741_824.0));
        assert_eq!(bytes(&q("1.5Gi")), Some(1_610_612_736.0));
        assert_eq!(bytes(&q("16393900Ki")), Some(16_787_353_600.0));
        assert_eq!(bytes(&q("500M")), Some(500_000_000.0));
        assert_eq!(bytes(&q("12e3")), Some(12_000.0));
        assert_eq!(bytes(&q("1E")), Some(1e18));
    }

    #[test]
    fn test_fractional_bytes_round_up() {
        let parsed = ParsedQuantity::parse("100m").unwrap();
        assert_eq!(parsed.value(), Some(1));
        assert_eq!(parsed.milli_value(), Some(100));
    }

    #[test]
    fn test_zero_quantities_are_skipped() {
        assert_eq!(cores(&q("0")), None);
        assert_eq!(bytes(&q("0Ki")), None);
        assert_eq!(cores(&q("0.000")), None);
    }

    #[test]
    fn test_invalid_quantities() {
        assert_eq!(ParsedQuantity::parse(""), Err(QuantityError::Empty));
        assert!(matches!(
            ParsedQuantity::parse("abc"),
            Err(QuantityError::InvalidNumber(_))
        ));
        assert!(matches!(
            ParsedQuantity::parse("10Xi"),
            Err(QuantityError::UnknownSuffix(_))
        ));
        assert!(matches!(
            ParsedQuantity::parse("1.2.3"),
            Err(QuantityError::InvalidNumber(_))
        ));
        assert_eq!(cores(&q("garbage")), None);
    }

    #[test]
    fn test_negative_quantity_rounds_toward_positive_infinity() {
        let parsed = ParsedQuantity::parse("-1500m").unwrap();
        assert_eq!(parsed.value(), Some(-1));
    }

    #[test]
    fn test_overflow_is_reported() {
        assert!(matches!(
            ParsedQuantity::parse("1234567890123456789012345678901234"),
            Err(QuantityError::Overflow(_))
        ));
        let huge = ParsedQuantity::parse("1e40").unwrap();
        assert_eq!(huge.value(), None);
    }
}
