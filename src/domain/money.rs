use thiserror::Error;

/// Amounts are integer cents, the fixed-point equivalent of a `DECIMAL(10, 2)` column.
/// 1 unit = 100 cents, so 50.00 = 5000 cents.
pub type Cents = i64;

/// Format cents as a decimal string.
/// Example: 5000 -> "50.00", -1234 -> "-12.34"
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs_cents = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs_cents / 100, abs_cents % 100)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCentsError {
    #[error("invalid money format: {0:?}")]
    InvalidFormat(String),

    #[error("amount out of range: {0}")]
    OutOfRange(String),
}

/// Parse a decimal string into cents.
/// Example: "50.00" -> 5000, "12.5" -> 1250, "100" -> 10000.
///
/// Digits past the second decimal place are truncated. The sign is kept, so
/// "-5" parses to -500; rejecting non-positive amounts is the caller's job.
pub fn parse_cents(input: &str) -> Result<Cents, ParseCentsError> {
    let trimmed = input.trim();
    let invalid = || ParseCentsError::InvalidFormat(trimmed.to_string());
    let out_of_range = || ParseCentsError::OutOfRange(trimmed.to_string());

    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let (units_str, fraction_str) = match digits.split_once('.') {
        Some((units, fraction)) => (units, fraction),
        None => (digits, ""),
    };

    if units_str.is_empty() && fraction_str.is_empty() {
        return Err(invalid());
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(units_str) || !all_digits(fraction_str) {
        return Err(invalid());
    }

    let units: i64 = if units_str.is_empty() {
        0
    } else {
        units_str.parse().map_err(|_| out_of_range())?
    };

    // "5" means 50 cents, "05" means 5 cents, anything past two digits is dropped
    let fraction: i64 = match fraction_str.len() {
        0 => 0,
        1 => i64::from(fraction_str.as_bytes()[0] - b'0') * 10,
        _ => fraction_str[..2].parse().map_err(|_| invalid())?,
    };

    let cents = units
        .checked_mul(100)
        .and_then(|c| c.checked_add(fraction))
        .ok_or_else(out_of_range)?;

    Ok(if negative { -cents } else { cents })
}
