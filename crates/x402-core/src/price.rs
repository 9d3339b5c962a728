//! Price-string parsing.
//!
//! Price strings strip an optional leading `$`; with no decimal point the
//! remainder is the asset's smallest integer unit, otherwise the fractional
//! part is padded/truncated to the asset's decimal count. `"$0"`/`"0"` is
//! the sentinel for a free route.

use crate::error::X402Error;

/// Known asset decimal counts. Unknown assets default to 6, matching most
/// stablecoins including the gateway's primary `USDC`.
pub fn decimals_for_asset(asset: &str) -> u32 {
    match asset.to_ascii_uppercase().as_str() {
        "USDC" => 6,
        "DAI" => 18,
        _ => 6,
    }
}

/// Parse a human price string (e.g. `"$0.01"`, `"10000"`) into a nonnegative
/// big-integer amount string, in the asset's smallest unit.
pub fn parse_price(price: &str, asset: &str) -> Result<String, X402Error> {
    let decimals = decimals_for_asset(asset) as usize;
    let trimmed = price.trim();
    let stripped = trimmed.strip_prefix('$').unwrap_or(trimmed);

    if stripped.is_empty() {
        return Err(X402Error::InvalidPrice(price.to_string()));
    }

    let (whole, frac) = match stripped.split_once('.') {
        Some((w, f)) => (w, f),
        None => {
            // No decimal point: treat as already being in the smallest unit.
            if !stripped.chars().all(|c| c.is_ascii_digit()) {
                return Err(X402Error::InvalidPrice(price.to_string()));
            }
            return Ok(normalize_int(stripped));
        }
    };

    if !whole.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
        || (whole.is_empty() && frac.is_empty())
    {
        return Err(X402Error::InvalidPrice(price.to_string()));
    }

    let whole = if whole.is_empty() { "0" } else { whole };
    let mut frac_digits: Vec<char> = frac.chars().collect();
    frac_digits.truncate(decimals);
    while frac_digits.len() < decimals {
        frac_digits.push('0');
    }
    let frac_str: String = frac_digits.into_iter().collect();

    let combined = format!("{whole}{frac_str}");
    Ok(normalize_int(&combined))
}

/// True when the parsed amount is the free-route sentinel (`"0"`).
pub fn is_free(amount: &str) -> bool {
    normalize_int(amount) == "0"
}

fn normalize_int(digits: &str) -> String {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_with_cents_usdc() {
        assert_eq!(parse_price("$0.01", "USDC").unwrap(), "10000");
        assert_eq!(parse_price("$1.00", "USDC").unwrap(), "1000000");
        assert_eq!(parse_price("$0.001", "USDC").unwrap(), "1000");
    }

    #[test]
    fn dollar_with_cents_dai() {
        assert_eq!(
            parse_price("$0.01", "DAI").unwrap(),
            "10000000000000000"
        );
    }

    #[test]
    fn truncates_excess_fraction_digits() {
        // USDC has 6 decimals; a 7th digit is truncated, not rounded.
        assert_eq!(parse_price("$0.0000009", "USDC").unwrap(), "0");
        assert_eq!(parse_price("$0.1234569", "USDC").unwrap(), "123456");
    }

    #[test]
    fn no_decimal_point_is_already_smallest_unit() {
        assert_eq!(parse_price("10000", "USDC").unwrap(), "10000");
    }

    #[test]
    fn free_sentinel() {
        assert!(is_free(&parse_price("$0", "USDC").unwrap()));
        assert!(is_free(&parse_price("0", "USDC").unwrap()));
        assert!(!is_free(&parse_price("$0.01", "USDC").unwrap()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_price("free", "USDC").is_err());
        assert!(parse_price("$", "USDC").is_err());
        assert!(parse_price("-1", "USDC").is_err());
    }

    #[test]
    fn unknown_asset_defaults_to_six_decimals() {
        assert_eq!(parse_price("$0.01", "WXYZ").unwrap(), "10000");
    }
}
