use std::io::{self, BufRead, Read, Write};

use crate::error::{OpalError, OpalResult};
use crate::eval::Machine;
use crate::heap::Heap;
use crate::location::SourceLocation;
use crate::quoting;
use crate::value::{Location, OpalValue};

/// Invoke the named intrinsic on already-evaluated arguments. Reads
/// argument values from the heap; the caller allocates the result.
pub fn dispatch(
    name: &str,
    sl: SourceLocation,
    args: &[Location],
    heap: &Heap,
) -> OpalResult<OpalValue> {
    match name {
        ".void" => {
            no_args(sl, args)?;
            Ok(OpalValue::Void)
        }
        ".+" => {
            let (a, b) = two_ints(sl, args, heap)?;
            Ok(OpalValue::Integer(a.wrapping_add(b)))
        }
        ".-" => {
            let (a, b) = two_ints(sl, args, heap)?;
            Ok(OpalValue::Integer(a.wrapping_sub(b)))
        }
        ".*" => {
            let (a, b) = two_ints(sl, args, heap)?;
            Ok(OpalValue::Integer(a.wrapping_mul(b)))
        }
        "./" => {
            let (a, b) = two_ints(sl, args, heap)?;
            if b == 0 {
                return Err(OpalError::runtime(sl, "division by zero"));
            }
            Ok(OpalValue::Integer(a.wrapping_div(b)))
        }
        ".%" => {
            let (a, b) = two_ints(sl, args, heap)?;
            if b == 0 {
                return Err(OpalError::runtime(sl, "division by zero"));
            }
            Ok(OpalValue::Integer(a.wrapping_rem(b)))
        }
        ".<" => int_compare(sl, args, heap, |a, b| a < b),
        ".<=" => int_compare(sl, args, heap, |a, b| a <= b),
        ".>" => int_compare(sl, args, heap, |a, b| a > b),
        ".>=" => int_compare(sl, args, heap, |a, b| a >= b),
        ".=" => int_compare(sl, args, heap, |a, b| a == b),
        "./=" => int_compare(sl, args, heap, |a, b| a != b),
        ".and" => {
            let (a, b) = two_ints(sl, args, heap)?;
            Ok(bool_value(a != 0 && b != 0))
        }
        ".or" => {
            let (a, b) = two_ints(sl, args, heap)?;
            Ok(bool_value(a != 0 || b != 0))
        }
        ".not" => {
            let a = one_int(sl, args, heap)?;
            Ok(bool_value(a == 0))
        }
        ".s+" => {
            let (a, b) = two_strings(sl, args, heap)?;
            let mut r = a.to_vec();
            r.extend_from_slice(b);
            Ok(OpalValue::String(r))
        }
        ".s<" => string_compare(sl, args, heap, |a, b| a < b),
        ".s<=" => string_compare(sl, args, heap, |a, b| a <= b),
        ".s>" => string_compare(sl, args, heap, |a, b| a > b),
        ".s>=" => string_compare(sl, args, heap, |a, b| a >= b),
        ".s=" => string_compare(sl, args, heap, |a, b| a == b),
        ".s/=" => string_compare(sl, args, heap, |a, b| a != b),
        ".s||" => {
            let s = one_string(sl, args, heap)?;
            Ok(OpalValue::Integer(s.len() as i64))
        }
        ".s[]" => {
            let (s, l, r) = string_range(sl, args, heap)?;
            let n = s.len() as i64;
            if !(0 <= l && l <= r && r < n) {
                return Err(OpalError::runtime(sl, "invalid substring range"));
            }
            Ok(OpalValue::String(s[l as usize..r as usize].to_vec()))
        }
        ".quote" => {
            let s = one_string(sl, args, heap)?;
            Ok(OpalValue::String(quoting::quote(s)))
        }
        ".unquote" => {
            let s = one_string(sl, args, heap)?;
            Ok(OpalValue::String(quoting::unquote(s)?))
        }
        ".s->i" => {
            let s = one_string(sl, args, heap)?;
            match std::str::from_utf8(s).ok().and_then(|t| t.parse::<i64>().ok()) {
                Some(v) => Ok(OpalValue::Integer(v)),
                None => Err(OpalError::runtime(sl, "non-numeric string")),
            }
        }
        ".i->s" => {
            let a = one_int(sl, args, heap)?;
            Ok(OpalValue::String(a.to_string().into_bytes()))
        }
        ".type" => {
            let value = one_any(sl, args, heap)?;
            Ok(OpalValue::Integer(value.type_tag()))
        }
        ".eval" => {
            let s = one_string(sl, args, heap)?.to_vec();
            eval_nested(sl, &s)
        }
        ".getchar" => {
            no_args(sl, args)?;
            match read_byte(sl)? {
                Some(byte) => Ok(OpalValue::String(vec![byte])),
                None => Ok(OpalValue::Void),
            }
        }
        ".getint" => {
            no_args(sl, args)?;
            match read_int(sl)? {
                Some(v) => Ok(OpalValue::Integer(v)),
                None => Ok(OpalValue::Void),
            }
        }
        ".putstr" => {
            let s = one_string(sl, args, heap)?;
            io::stdout()
                .write_all(s)
                .map_err(|e| OpalError::runtime(sl, format!("write failed: {}", e)))?;
            Ok(OpalValue::Void)
        }
        ".flush" => {
            no_args(sl, args)?;
            io::stdout()
                .flush()
                .map_err(|e| OpalError::runtime(sl, format!("flush failed: {}", e)))?;
            Ok(OpalValue::Void)
        }
        _ => Err(OpalError::runtime(sl, "unrecognized intrinsic call")),
    }
}

/// Run a nested interpreter over `source` and copy its scalar result into
/// the caller's world. The nested machine's heap and arena die with it, so
/// a closure result cannot be transplanted.
fn eval_nested(sl: SourceLocation, source: &[u8]) -> OpalResult<OpalValue> {
    let mut machine = Machine::new(source)?;
    machine.execute()?;
    match machine.result_value() {
        OpalValue::Void => Ok(OpalValue::Void),
        OpalValue::Integer(v) => Ok(OpalValue::Integer(*v)),
        OpalValue::String(s) => Ok(OpalValue::String(s.clone())),
        OpalValue::Closure(_) => Err(OpalError::runtime(sl, "eval result cannot be a closure")),
    }
}

// ============================================================================
// Argument checking
// ============================================================================

fn type_error(sl: SourceLocation) -> OpalError {
    OpalError::runtime(sl, "type error on intrinsic call")
}

fn bool_value(b: bool) -> OpalValue {
    OpalValue::Integer(if b { 1 } else { 0 })
}

fn no_args(sl: SourceLocation, args: &[Location]) -> OpalResult<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(type_error(sl))
    }
}

fn one_any<'a>(sl: SourceLocation, args: &[Location], heap: &'a Heap) -> OpalResult<&'a OpalValue> {
    match args {
        [a] => Ok(heap.get(*a)),
        _ => Err(type_error(sl)),
    }
}

fn one_int(sl: SourceLocation, args: &[Location], heap: &Heap) -> OpalResult<i64> {
    match args {
        [a] => heap.get(*a).as_integer().ok_or_else(|| type_error(sl)),
        _ => Err(type_error(sl)),
    }
}

fn two_ints(sl: SourceLocation, args: &[Location], heap: &Heap) -> OpalResult<(i64, i64)> {
    match args {
        [a, b] => match (heap.get(*a).as_integer(), heap.get(*b).as_integer()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(type_error(sl)),
        },
        _ => Err(type_error(sl)),
    }
}

fn one_string<'a>(sl: SourceLocation, args: &[Location], heap: &'a Heap) -> OpalResult<&'a [u8]> {
    match args {
        [a] => heap.get(*a).as_string().ok_or_else(|| type_error(sl)),
        _ => Err(type_error(sl)),
    }
}

fn two_strings<'a>(
    sl: SourceLocation,
    args: &[Location],
    heap: &'a Heap,
) -> OpalResult<(&'a [u8], &'a [u8])> {
    match args {
        [a, b] => match (heap.get(*a).as_string(), heap.get(*b).as_string()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(type_error(sl)),
        },
        _ => Err(type_error(sl)),
    }
}

fn string_range<'a>(
    sl: SourceLocation,
    args: &[Location],
    heap: &'a Heap,
) -> OpalResult<(&'a [u8], i64, i64)> {
    match args {
        [s, l, r] => match (
            heap.get(*s).as_string(),
            heap.get(*l).as_integer(),
            heap.get(*r).as_integer(),
        ) {
            (Some(s), Some(l), Some(r)) => Ok((s, l, r)),
            _ => Err(type_error(sl)),
        },
        _ => Err(type_error(sl)),
    }
}

fn int_compare(
    sl: SourceLocation,
    args: &[Location],
    heap: &Heap,
    cmp: impl Fn(i64, i64) -> bool,
) -> OpalResult<OpalValue> {
    let (a, b) = two_ints(sl, args, heap)?;
    Ok(bool_value(cmp(a, b)))
}

fn string_compare(
    sl: SourceLocation,
    args: &[Location],
    heap: &Heap,
    cmp: impl Fn(&[u8], &[u8]) -> bool,
) -> OpalResult<OpalValue> {
    let (a, b) = two_strings(sl, args, heap)?;
    Ok(bool_value(cmp(a, b)))
}

// ============================================================================
// Console input
// ============================================================================

fn io_error(sl: SourceLocation, e: io::Error) -> OpalError {
    OpalError::runtime(sl, format!("read failed: {}", e))
}

/// Read one byte from stdin; None on end of input.
fn read_byte(sl: SourceLocation) -> OpalResult<Option<u8>> {
    let mut byte = [0u8; 1];
    match io::stdin().lock().read(&mut byte) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(byte[0])),
        Err(e) => Err(io_error(sl, e)),
    }
}

/// Read a whitespace-delimited signed decimal integer from stdin. Missing
/// digits or overflow yield None; the stream is left at the first byte
/// after the consumed prefix.
fn read_int(sl: SourceLocation) -> OpalResult<Option<i64>> {
    let mut stdin = io::stdin().lock();

    // skip leading whitespace
    loop {
        let buf = stdin.fill_buf().map_err(|e| io_error(sl, e))?;
        if buf.is_empty() {
            return Ok(None);
        }
        let skip = buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        let done = skip < buf.len();
        stdin.consume(skip);
        if done {
            break;
        }
    }

    let mut negative = false;
    let first = stdin.fill_buf().map_err(|e| io_error(sl, e))?.first().copied();
    match first {
        Some(b'+') => stdin.consume(1),
        Some(b'-') => {
            negative = true;
            stdin.consume(1);
        }
        _ => {}
    }

    let mut value: i64 = 0;
    let mut has_digit = false;
    let mut overflow = false;
    loop {
        let buf = stdin.fill_buf().map_err(|e| io_error(sl, e))?;
        let Some(&c) = buf.first() else {
            break;
        };
        if !c.is_ascii_digit() {
            break;
        }
        has_digit = true;
        let digit = (c - b'0') as i64;
        value = match value.checked_mul(10).and_then(|v| {
            if negative {
                v.checked_sub(digit)
            } else {
                v.checked_add(digit)
            }
        }) {
            Some(v) => v,
            None => {
                overflow = true;
                value
            }
        };
        stdin.consume(1);
    }

    if !has_digit || overflow {
        return Ok(None);
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn heap_with(values: Vec<OpalValue>) -> (Heap, Vec<Location>) {
        let mut heap = Heap::new();
        let locs = values.into_iter().map(|v| heap.alloc(v)).collect();
        (heap, locs)
    }

    fn sl() -> SourceLocation {
        SourceLocation::start()
    }

    #[test]
    fn arithmetic_wraps_instead_of_trapping() {
        let (heap, locs) = heap_with(vec![
            OpalValue::Integer(i64::MAX),
            OpalValue::Integer(1),
        ]);
        let v = dispatch(".+", sl(), &locs, &heap).unwrap();
        assert_eq!(v.as_integer(), Some(i64::MIN));

        let (heap, locs) = heap_with(vec![
            OpalValue::Integer(i64::MIN),
            OpalValue::Integer(-1),
        ]);
        let v = dispatch("./", sl(), &locs, &heap).unwrap();
        assert_eq!(v.as_integer(), Some(i64::MIN));
    }

    #[test]
    fn comparisons_yield_zero_or_one() {
        let (heap, locs) = heap_with(vec![OpalValue::Integer(3), OpalValue::Integer(3)]);
        assert_eq!(dispatch(".=", sl(), &locs, &heap).unwrap().as_integer(), Some(1));
        assert_eq!(dispatch(".<", sl(), &locs, &heap).unwrap().as_integer(), Some(0));
        assert_eq!(dispatch(".<=", sl(), &locs, &heap).unwrap().as_integer(), Some(1));
    }

    #[test]
    fn string_comparison_is_bytewise() {
        let (heap, locs) = heap_with(vec![
            OpalValue::String(b"abc".to_vec()),
            OpalValue::String(b"abd".to_vec()),
        ]);
        assert_eq!(dispatch(".s<", sl(), &locs, &heap).unwrap().as_integer(), Some(1));
        assert_eq!(dispatch(".s=", sl(), &locs, &heap).unwrap().as_integer(), Some(0));
    }

    #[test]
    fn substring_takes_a_half_open_range() {
        let (heap, locs) = heap_with(vec![
            OpalValue::String(b"abcdef".to_vec()),
            OpalValue::Integer(2),
            OpalValue::Integer(5),
        ]);
        let v = dispatch(".s[]", sl(), &locs, &heap).unwrap();
        assert_eq!(v.as_string(), Some(&b"cde"[..]));
    }

    #[test]
    fn strict_integer_parsing() {
        let (heap, locs) = heap_with(vec![OpalValue::String(b"12ab".to_vec())]);
        let e = dispatch(".s->i", sl(), &locs, &heap).unwrap_err();
        assert_eq!(e.message, "non-numeric string");

        let (heap, locs) = heap_with(vec![OpalValue::String(b"+7".to_vec())]);
        let v = dispatch(".s->i", sl(), &locs, &heap).unwrap();
        assert_eq!(v.as_integer(), Some(7));
    }

    #[test]
    fn arity_mismatch_is_a_type_error() {
        let (heap, locs) = heap_with(vec![OpalValue::Integer(1)]);
        let e = dispatch(".+", sl(), &locs, &heap).unwrap_err();
        assert_eq!(e.message, "type error on intrinsic call");
        let e = dispatch(".void", sl(), &locs, &heap).unwrap_err();
        assert_eq!(e.message, "type error on intrinsic call");
    }

    #[test]
    fn nested_eval_propagates_inner_errors() {
        let (heap, locs) = heap_with(vec![OpalValue::String(b"(./ 1 0)".to_vec())]);
        let e = dispatch(".eval", sl(), &locs, &heap).unwrap_err();
        assert_eq!(e.message, "division by zero");
    }

    #[test]
    fn nested_eval_copies_scalars() {
        let (heap, locs) = heap_with(vec![OpalValue::String(b"(.i->s 99)".to_vec())]);
        let v = dispatch(".eval", sl(), &locs, &heap).unwrap();
        assert_eq!(v.as_string(), Some(&b"99"[..]));
    }

    proptest::proptest! {
        #[test]
        fn integer_conversions_round_trip(v in proptest::prelude::any::<i64>()) {
            let (heap, locs) = heap_with(vec![OpalValue::Integer(v)]);
            let rendered = dispatch(".i->s", sl(), &locs, &heap).unwrap();
            let (heap, locs) = heap_with(vec![rendered]);
            let back = dispatch(".s->i", sl(), &locs, &heap).unwrap();
            proptest::prop_assert_eq!(back.as_integer(), Some(v));
        }
    }
}
