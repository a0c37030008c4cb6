use crate::error::{Error, Result};

/// State marker written as the first byte of every record frame.
pub const LIVE_MARKER: u8 = b' ';
/// State marker a frame is rewritten to once consumed.
pub const DEAD_MARKER: u8 = b'-';

/// Result of classifying a scanned line by its leading byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification<'a> {
    /// A live record; the payload is the line with the marker byte stripped.
    Live(&'a str),
    /// A tombstoned (already-consumed) record.
    Dead,
    /// Not a record frame at all — scanning continues past it.
    Noise,
}

/// Encodes a payload as an on-disk frame: `0x20 <payload> 0x0A`.
///
/// # Errors
///
/// Returns [`Error::InvalidPayload`] if `payload` contains a newline, which would otherwise be
/// indistinguishable from the frame terminator.
pub fn encode_append(payload: &str) -> Result<Vec<u8>> {
    if payload.contains('\n') {
        return Err(Error::InvalidPayload);
    }

    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(LIVE_MARKER);
    frame.extend_from_slice(payload.as_bytes());
    frame.push(b'\n');
    Ok(frame)
}

/// Classifies a line produced by the scanner (no trailing `\n`) by its first byte.
pub fn classify(line: &str) -> Classification<'_> {
    match line.as_bytes().first() {
        Some(&LIVE_MARKER) => Classification::Live(&line[1..]),
        Some(&DEAD_MARKER) => Classification::Dead,
        _ => Classification::Noise,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_with_marker_and_newline() {
        let frame = encode_append("abc").unwrap();
        assert_eq!(frame, b" abc\n");
    }

    #[test]
    fn rejects_embedded_newline() {
        assert!(matches!(encode_append("a\nb"), Err(Error::InvalidPayload)));
    }

    #[test]
    fn classifies_live_dead_and_noise() {
        assert_eq!(classify(" abc"), Classification::Live("abc"));
        assert_eq!(classify("-abc"), Classification::Dead);
        assert_eq!(classify("?abc"), Classification::Noise);
        assert_eq!(classify(""), Classification::Noise);
    }

    proptest! {
        #[test]
        fn any_newline_free_payload_survives_the_frame_unmarked(payload in "[^\n]*") {
            let frame = encode_append(&payload).unwrap();
            let line = std::str::from_utf8(&frame[..frame.len() - 1]).unwrap();
            match classify(line) {
                Classification::Live(stripped) => prop_assert_eq!(stripped, payload),
                other => prop_assert!(false, "expected a live classification, got {other:?}"),
            }
        }
    }
}
