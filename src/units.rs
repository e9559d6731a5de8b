//! Conversion between decimal token amounts and rail-native atomic units

use crate::error::EscrowError;
use crate::types::Amount;

/// Parse a decimal string such as `"12.5"` into atomic units.
pub fn parse_units(value: &str, decimals: u32) -> Result<Amount, EscrowError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EscrowError::InvalidAmount("empty amount".to_string()));
    }

    let (whole, frac) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(EscrowError::InvalidAmount(value.to_string()));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(EscrowError::InvalidAmount(format!(
            "'{}' is not a non-negative decimal",
            value
        )));
    }
    if frac.len() > decimals as usize {
        return Err(EscrowError::InvalidAmount(format!(
            "'{}' has more than {} decimal places",
            value, decimals
        )));
    }

    let scale = pow10(decimals)?;
    let overflow = || EscrowError::InvalidAmount(format!("'{}' is too large", value));

    let whole_units: Amount = if whole.is_empty() {
        0
    } else {
        whole.parse::<Amount>().map_err(|_| overflow())?
    };
    let frac_units: Amount = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = decimals as usize);
        padded.parse::<Amount>().map_err(|_| overflow())?
    };

    whole_units
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_units))
        .ok_or_else(overflow)
}

/// Render atomic units as a decimal string without trailing zeros.
pub fn format_units(value: Amount, decimals: u32) -> String {
    if decimals == 0 {
        return value.to_string();
    }
    let Ok(scale) = pow10(decimals) else {
        return value.to_string();
    };
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac, width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

fn pow10(decimals: u32) -> Result<Amount, EscrowError> {
    (10 as Amount)
        .checked_pow(decimals)
        .ok_or_else(|| EscrowError::InvalidConfig(format!("unsupported decimals {}", decimals)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_units("1", 6).unwrap(), 1_000_000);
        assert_eq!(parse_units("12.5", 6).unwrap(), 12_500_000);
        assert_eq!(parse_units("0.000001", 6).unwrap(), 1);
        assert_eq!(parse_units(".5", 2).unwrap(), 50);
        assert_eq!(parse_units("100", 0).unwrap(), 100);
        assert_eq!(
            parse_units("1.5", 18).unwrap(),
            1_500_000_000_000_000_000
        );
    }

    #[test]
    fn test_parse_units_rejects_malformed() {
        assert!(parse_units("", 6).is_err());
        assert!(parse_units(".", 6).is_err());
        assert!(parse_units("-1", 6).is_err());
        assert!(parse_units("1.2.3", 6).is_err());
        assert!(parse_units("1e6", 6).is_err());
        assert!(parse_units("0.0000001", 6).is_err());
        assert!(parse_units("999999999999999999999999999999999999999999", 18).is_err());
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(12_500_000, 6), "12.5");
        assert_eq!(format_units(1, 6), "0.000001");
        assert_eq!(format_units(3_000_000, 6), "3");
        assert_eq!(format_units(42, 0), "42");
    }
}
