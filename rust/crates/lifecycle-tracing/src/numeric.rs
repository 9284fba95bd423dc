//! Parsing of numeric header values such as `Content-Length`.

/// Longest input accepted. Sixteen digits is the first length at which a
/// double can no longer represent every integer exactly.
const MAX_DIGITS: usize = 16;

/// Parses a content-length-like header value into an integer.
///
/// Returns `None` for empty input, anything that isn't an integer, and
/// anything longer than sixteen characters. A sixteen-character value is
/// only accepted if it survives a round trip through a double unchanged,
/// so oversized values can't silently lose precision.
///
/// Only decimal notation is understood: hexadecimal such as `0x1A` is
/// treated as absent.
pub fn parse_numeric_string(message: &str) -> Option<i64> {
    match message.len() {
        0 => None,
        len if len < MAX_DIGITS => to_integer(message.trim().parse::<f64>().ok()?),
        MAX_DIGITS => {
            if message.trim().is_empty() {
                return None;
            }
            let number = message.parse::<f64>().ok()?;
            if number.to_string() != message {
                return None;
            }
            to_integer(number)
        }
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_integer(number: f64) -> Option<i64> {
    if number.is_finite() && number.fract() == 0.0 {
        Some(number as i64)
    } else {
        None
    }
}
