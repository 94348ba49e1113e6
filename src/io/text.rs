/*!
 * Text Normalization
 * Carriage-return stripping for child output
 */

/// Remove every `\r` byte in place, returning the retained length
///
/// Retained bytes keep their order and are packed at the front of `buf`.
#[inline]
pub fn strip_carriage_returns(buf: &mut [u8]) -> usize {
    let mut insert = 0;
    for parse in 0..buf.len() {
        let byte = buf[parse];
        if byte != b'\r' {
            buf[insert] = byte;
            insert += 1;
        }
    }
    insert
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crlf_becomes_lf() {
        let mut buf = *b"abc\r\ndef\r\n";
        let n = strip_carriage_returns(&mut buf);
        assert_eq!(&buf[..n], b"abc\ndef\n");
    }

    #[test]
    fn test_only_carriage_returns() {
        let mut buf = *b"\r\r\r";
        assert_eq!(strip_carriage_returns(&mut buf), 0);
    }

    #[test]
    fn test_empty() {
        let mut buf: [u8; 0] = [];
        assert_eq!(strip_carriage_returns(&mut buf), 0);
    }

    proptest! {
        #[test]
        fn prop_matches_filter(input in proptest::collection::vec(any::<u8>(), 0..512)) {
            let expected: Vec<u8> = input.iter().copied().filter(|&b| b != b'\r').collect();
            let mut buf = input.clone();
            let n = strip_carriage_returns(&mut buf);
            prop_assert_eq!(&buf[..n], &expected[..]);
        }
    }
}
