//! Kubernetes quantity parsing, so `"1000m"` and `"1"` compare equal.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{input:?}: {reason}")]
pub struct QuantityError { pub input: String, pub reason: &'static str }

const NANO: i128 = 1_000_000_000;

/// Parses a quantity into nano-units. Binary suffixes (`Ki`..`Ei`), decimal
/// suffixes (`n`..`E`) and exponent forms (`1e3`) are accepted.
pub fn parse_quantity(input: &str) -> Result<i128, QuantityError> {
    let err = |reason| QuantityError { input: input.to_string(), reason };
    let s = input.trim();
    if s.is_empty() { return Err(err("empty")); }

    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-')).unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (mantissa_scale, exponent) = match suffix {
        "" => (NANO, 0),
        "n" => (1, 0),
        "u" => (1_000, 0),
        "m" => (1_000_000, 0),
        "k" => (NANO * 1_000, 0),
        "M" => (NANO * 1_000_000, 0),
        "G" => (NANO * 1_000_000_000, 0),
        "T" => (NANO * 1_000_000_000_000, 0),
        "P" => (NANO * 1_000_000_000_000_000, 0),
        "E" => (NANO * 1_000_000_000_000_000_000, 0),
        "Ki" => (NANO << 10, 0),
        "Mi" => (NANO << 20, 0),
        "Gi" => (NANO << 30, 0),
        "Ti" => (NANO << 40, 0),
        "Pi" => (NANO << 50, 0),
        "Ei" => (NANO << 60, 0),
        e if e.starts_with(|c| c == 'e' || c == 'E') => {
            let exp: i32 = e[1..].parse().map_err(|_| err("bad exponent"))?;
            if exp.abs() > 18 { return Err(err("exponent out of range")); }
            (NANO, exp)
        }
        _ => return Err(err("unknown suffix")),
    };

    let (negative, digits) = match number.as_bytes().first() {
        Some(b'-') => (true, &number[1..]),
        Some(b'+') => (false, &number[1..]),
        _ => (false, number),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() { return Err(err("missing number")); }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) { return Err(err("malformed number")); }
    if int_part.len() + frac_part.len() > 30 { return Err(err("too many digits")); }

    // value = int.frac * 10^exponent * scale, computed exactly then truncated
    let all_digits: i128 = format!("{int_part}{frac_part}").parse().unwrap_or(0);
    let mut value = all_digits.checked_mul(mantissa_scale).ok_or_else(|| err("overflow"))?;
    let shift = exponent - frac_part.len() as i32;
    let factor = 10i128.checked_pow(shift.unsigned_abs()).ok_or_else(|| err("exponent out of range"))?;
    if shift >= 0 {
        value = value.checked_mul(factor).ok_or_else(|| err("overflow"))?;
    } else {
        value /= factor;
    }
    Ok(if negative { -value } else { value })
}

/// Scales a quantity by `num/den` and renders it in milli-units, which the API
/// server accepts for every resource. Used for requests derived from limits.
pub fn scaled(input: &str, num: i128, den: i128) -> Result<String, QuantityError> {
    let overflow = || QuantityError { input: input.to_string(), reason: "overflow" };
    let nanos = parse_quantity(input)?.checked_mul(num).ok_or_else(overflow)? / den;
    let milli = nanos / 1_000_000;
    if milli % 1000 == 0 { Ok((milli / 1000).to_string()) } else { Ok(format!("{milli}m")) }
}
