//! Memory-string parsing
//!
//! Limits arrive as `<float><unit>` strings (`"8GB"`, `"1.5TB"`). The unit is
//! the last two characters and is interpreted as a binary multiple.

use crate::{Error, Result};

const KIB: u64 = 1024;

fn unit_multiplier(unit: &str) -> Option<u64> {
    match unit {
        "KB" => Some(KIB),
        "MB" => Some(KIB * KIB),
        "GB" => Some(KIB * KIB * KIB),
        "TB" => Some(KIB * KIB * KIB * KIB),
        _ => None,
    }
}

/// Parse a memory string into bytes.
///
/// `"8GB"` is 8 * 1024^3 bytes; `"1.5TB"` is 1.5 * 1024^4 bytes.
pub fn parse_memory(size: &str) -> Result<i64> {
    if size.len() <= 2 {
        return Err(Error::InvalidMemoryFormat(size.to_string()));
    }

    let (value_str, unit) = size.split_at(size.len() - 2);
    let multiplier =
        unit_multiplier(unit).ok_or_else(|| Error::InvalidMemoryFormat(size.to_string()))?;

    let value: f64 = value_str
        .parse()
        .map_err(|_| Error::InvalidMemoryFormat(size.to_string()))?;
    if value < 0.0 {
        return Err(Error::InvalidMemoryFormat(size.to_string()));
    }

    Ok((value * multiplier as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whole_units() {
        assert_eq!(parse_memory("1KB").unwrap(), 1024);
        assert_eq!(parse_memory("256MB").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory("8GB").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("2TB").unwrap(), 2 * 1024_i64.pow(4));
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(
            parse_memory("1.5TB").unwrap(),
            (1.5 * 1024_f64.powi(4)) as i64
        );
        assert_eq!(parse_memory("0.5GB").unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            parse_memory("8G"),
            Err(Error::InvalidMemoryFormat(_))
        ));
        assert!(matches!(
            parse_memory("GB"),
            Err(Error::InvalidMemoryFormat(_))
        ));
        assert!(matches!(
            parse_memory("eightGB"),
            Err(Error::InvalidMemoryFormat(_))
        ));
        assert!(matches!(
            parse_memory("8PB"),
            Err(Error::InvalidMemoryFormat(_))
        ));
        assert!(matches!(
            parse_memory("-1GB"),
            Err(Error::InvalidMemoryFormat(_))
        ));
        assert!(matches!(
            parse_memory(""),
            Err(Error::InvalidMemoryFormat(_))
        ));
    }

}
