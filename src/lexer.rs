use crate::error::{OpalError, OpalResult};
use crate::location::SourceLocation;

/// One lexical token: its starting location and raw text. String tokens
/// keep their surrounding quotes and escapes; unquoting happens later.
#[derive(Debug, Clone)]
pub struct Token {
    pub sl: SourceLocation,
    pub text: String,
}

/// Every byte the language accepts in source text.
const CHARSET: &[u8] = b"`1234567890-=~!@#$%^&*()_+\
qwertyuiopasdfghjklzxcvbnmQWERTYUIOPASDFGHJKLZXCVBNM\
[]\\;',./{}|:\"<>? \t\n";

/// Cursor over the source bytes, tracking the current location.
struct SourceStream<'a> {
    source: &'a [u8],
    pos: usize,
    sl: SourceLocation,
}

impl<'a> SourceStream<'a> {
    /// Validate the whole source against the charset up front, so the
    /// tokenizer only ever sees known bytes.
    fn new(source: &'a [u8]) -> OpalResult<Self> {
        let mut sl = SourceLocation::start();
        for &c in source {
            if !CHARSET.contains(&c) {
                return Err(OpalError::lexer(sl, "unsupported character"));
            }
            sl.advance(c);
        }
        Ok(SourceStream {
            source,
            pos: 0,
            sl: SourceLocation::start(),
        })
    }

    fn has_next(&self) -> bool {
        self.pos < self.source.len()
    }

    fn peek_next(&self) -> u8 {
        self.source[self.pos]
    }

    fn pop_next(&mut self) -> u8 {
        let c = self.source[self.pos];
        self.pos += 1;
        self.sl.advance(c);
        c
    }
}

/// Split source bytes into tokens.
pub fn lex(source: &[u8]) -> OpalResult<Vec<Token>> {
    let mut ss = SourceStream::new(source)?;
    let mut tokens = Vec::new();
    while let Some(token) = next_token(&mut ss)? {
        tokens.push(token);
    }
    Ok(tokens)
}

fn next_token(ss: &mut SourceStream<'_>) -> OpalResult<Option<Token>> {
    loop {
        while ss.has_next() && ss.peek_next().is_ascii_whitespace() {
            ss.pop_next();
        }
        if !ss.has_next() {
            return Ok(None);
        }
        let start_sl = ss.sl;
        let mut text = Vec::new();
        let c = ss.peek_next();
        if c.is_ascii_digit() || c == b'-' || c == b'+' {
            // integer literal
            if c == b'-' || c == b'+' {
                text.push(ss.pop_next());
            }
            let mut has_digit = false;
            while ss.has_next() && ss.peek_next().is_ascii_digit() {
                has_digit = true;
                text.push(ss.pop_next());
            }
            if !has_digit {
                return Err(OpalError::lexer(start_sl, "incomplete integer literal"));
            }
        } else if c == b'"' {
            // string literal; backslash toggles the escape state
            text.push(ss.pop_next());
            let mut complete = false;
            let mut escape = false;
            while ss.has_next() {
                if !escape && ss.peek_next() == b'"' {
                    text.push(ss.pop_next());
                    complete = true;
                    break;
                }
                let c = ss.pop_next();
                escape = c == b'\\' && !escape;
                text.push(c);
            }
            if !complete {
                return Err(OpalError::lexer(start_sl, "incomplete string literal"));
            }
        } else if c.is_ascii_alphabetic() || c == b'_' {
            // variable or keyword
            while ss.has_next()
                && (ss.peek_next().is_ascii_alphanumeric() || ss.peek_next() == b'_')
            {
                text.push(ss.pop_next());
            }
        } else if c == b'.' {
            // intrinsic name runs to whitespace or a closing paren
            while ss.has_next() && !(ss.peek_next().is_ascii_whitespace() || ss.peek_next() == b')')
            {
                text.push(ss.pop_next());
            }
        } else if b"(){}@".contains(&c) {
            text.push(ss.pop_next());
        } else if c == b'#' {
            // comment to end of line
            while ss.has_next() && ss.peek_next() != b'\n' {
                ss.pop_next();
            }
            continue;
        } else {
            return Err(OpalError::lexer(start_sl, "unsupported starting character"));
        }
        // the charset is ASCII, so token bytes always form valid UTF-8
        return Ok(Some(Token {
            sl: start_sl,
            text: String::from_utf8_lossy(&text).into_owned(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ErrorKind;

    fn texts(source: &[u8]) -> Vec<String> {
        lex(source).unwrap().into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn tokenizes_every_token_class() {
        assert_eq!(
            texts(b"(.+ 1 -2) {x} @ y \"a\\\"b\" lambda"),
            vec!["(", ".+", "1", "-2", ")", "{", "x", "}", "@", "y", "\"a\\\"b\"", "lambda"]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(texts(b"1 # two three\n4"), vec!["1", "4"]);
    }

    #[test]
    fn tracks_source_locations() {
        let tokens = lex(b"ab\n  cd").unwrap();
        assert_eq!(tokens[0].sl, SourceLocation { line: 1, column: 1 });
        assert_eq!(tokens[1].sl, SourceLocation { line: 2, column: 3 });
    }

    #[test]
    fn rejects_bytes_outside_the_charset() {
        let e = lex("§".as_bytes()).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Lexer);
        assert_eq!(e.message, "unsupported character");
    }

    #[test]
    fn rejects_a_bare_sign() {
        let e = lex(b"(- 1 2)").unwrap_err();
        assert_eq!(e.message, "incomplete integer literal");
    }

    #[test]
    fn rejects_an_unterminated_string() {
        let e = lex(b"\"abc").unwrap_err();
        assert_eq!(e.message, "incomplete string literal");
    }

    #[test]
    fn intrinsic_token_stops_at_paren() {
        assert_eq!(texts(b"(.s||)"), vec!["(", ".s||", ")"]);
    }
}
