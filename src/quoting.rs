use crate::error::{OpalError, OpalResult};

/// Wrap a byte string in double quotes, escaping backslash and quote.
/// Tabs and newlines are kept raw; `unquote` accepts both spellings.
pub fn quote(s: &[u8]) -> Vec<u8> {
    let mut r = Vec::with_capacity(s.len() + 2);
    r.push(b'"');
    for &c in s {
        match c {
            b'\\' => r.extend_from_slice(b"\\\\"),
            b'"' => r.extend_from_slice(b"\\\""),
            _ => r.push(c),
        }
    }
    r.push(b'"');
    r
}

/// Strip surrounding double quotes and process the `\\`, `\"`, `\t`, `\n`
/// escape sequences. Any other escape, a dangling backslash, or a missing
/// quote is an unquote error.
pub fn unquote(s: &[u8]) -> OpalResult<Vec<u8>> {
    let n = s.len();
    if !(n >= 2 && s[0] == b'"' && s[n - 1] == b'"') {
        return Err(OpalError::unquote("invalid quoted string"));
    }
    let body = &s[1..n - 1];
    let mut r = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let c = body[i];
        i += 1;
        if c != b'\\' {
            r.push(c);
            continue;
        }
        if i >= body.len() {
            return Err(OpalError::unquote("incomplete escape sequence"));
        }
        let c1 = body[i];
        i += 1;
        match c1 {
            b'\\' => r.push(b'\\'),
            b'"' => r.push(b'"'),
            b't' => r.push(b'\t'),
            b'n' => r.push(b'\n'),
            _ => return Err(OpalError::unquote("invalid escape sequence")),
        }
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn quote_escapes_backslash_and_quote() {
        assert_eq!(quote(b"ab"), b"\"ab\"".to_vec());
        assert_eq!(quote(b"a\\b\"c"), b"\"a\\\\b\\\"c\"".to_vec());
        assert_eq!(quote(b"a\tb\n"), b"\"a\tb\n\"".to_vec());
    }

    #[test]
    fn unquote_processes_all_four_escapes() {
        assert_eq!(unquote(b"\"a\\\\b\\\"c\\td\\ne\"").unwrap(), b"a\\b\"c\td\ne".to_vec());
    }

    #[test]
    fn unquote_rejects_bad_input() {
        assert!(unquote(b"abc").is_err());
        assert!(unquote(b"\"").is_err());
        assert!(unquote(b"\"a\\x\"").is_err());
        assert!(unquote(b"\"a\\\"").is_err());
    }

    proptest! {
        #[test]
        fn unquote_inverts_quote(s in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(unquote(&quote(&s)).unwrap(), s);
        }

        #[test]
        fn quote_inverts_unquote_on_quoted_strings(
            s in proptest::collection::vec(any::<u8>(), 0..64)
        ) {
            let q = quote(&s);
            prop_assert_eq!(quote(&unquote(&q).unwrap()), q);
        }
    }
}
