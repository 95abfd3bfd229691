//! Token-level parsing: integer literals in every accepted radix, C-style
//! character and string escapes, and symbol validation.

use pest::iterators::Pair;

use crate::storage::Value;
use crate::{new_parser_error, Result, Rule};

/// Decimal, `0x`/`0X` hex, `0b` binary or leading-zero octal, with an
/// optional sign.
pub fn parse_int(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if body.is_empty() {
        return None;
    }

    let magnitude: u64 = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).ok()?
    } else if body != "0" && body.starts_with('0') {
        u64::from_str_radix(&body[1..], 8).ok()?
    } else {
        body.parse().ok()?
    };

    if negative {
        if magnitude > 1u64 << 63 {
            return None;
        }
        Some((magnitude as i64).wrapping_neg())
    } else {
        if magnitude > i64::max_value() as u64 {
            return None;
        }
        Some(magnitude as i64)
    }
}

fn escape_value(escape: u8, rest: &mut std::slice::Iter<u8>) -> Option<u8> {
    Some(match escape {
        b'n' => b'\n',
        b't' => b'\t',
        b'r' => b'\r',
        b'0' => 0,
        b'a' => 0x07,
        b'b' => 0x08,
        b'f' => 0x0C,
        b'v' => 0x0B,
        b'\\' => b'\\',
        b'\'' => b'\'',
        b'"' => b'"',
        b'x' => {
            let hi = (*rest.next()? as char).to_digit(16)?;
            let lo = (*rest.next()? as char).to_digit(16)?;
            (hi * 16 + lo) as u8
        }
        _ => return None,
    })
}

/// The body of a character literal (quotes stripped) to its byte value.
pub fn parse_char(body: &str) -> Option<u8> {
    let bytes = body.as_bytes();
    let mut iter = bytes.iter();
    let value = match *iter.next()? {
        b'\\' => escape_value(*iter.next()?, &mut iter)?,
        byte => byte,
    };
    match iter.next() {
        None => Some(value),
        Some(_) => None,
    }
}

/// The body of a double-quoted string (quotes stripped) to raw bytes, with
/// the same escape set as character literals.
pub fn unescape_string(body: &str) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(body.len());
    let bytes = body.as_bytes();
    let mut iter = bytes.iter();
    while let Some(&byte) = iter.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        let escape = *iter
            .next()
            .ok_or_else(|| "Incomplete escape sequence".to_owned())?;
        let value = escape_value(escape, &mut iter)
            .ok_or_else(|| format!("Unknown escape sequence: \\{}", escape as char))?;
        out.push(value);
    }
    Ok(out)
}

pub fn is_symbol(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if !first.is_ascii_digit() => {}
        _ => return false,
    }
    text.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$')
}

/// An operand pair as a plain integer; character literals count.
pub fn process_int(pair: &Pair<Rule>) -> Result<i64> {
    match pair.as_rule() {
        Rule::token => parse_int(pair.as_str()).ok_or_else(|| {
            new_parser_error(
                pair.as_span(),
                format!("Invalid integer: \"{}\"", pair.as_str()),
            )
        }),
        Rule::char_lit => {
            let body = pair.clone().into_inner().next().unwrap();
            parse_char(body.as_str()).map(i64::from).ok_or_else(|| {
                new_parser_error(
                    pair.as_span(),
                    format!("Invalid character literal: {}", pair.as_str()),
                )
            })
        }
        _ => Err(new_parser_error(
            pair.as_span(),
            "Expected an integer".to_owned(),
        )),
    }
}

/// An operand pair as a non-negative integer below `limit`.
pub fn process_uint(pair: &Pair<Rule>, limit: u64) -> Result<u64> {
    let value = process_int(pair)?;
    if value < 0 || value as u64 >= limit {
        return Err(new_parser_error(
            pair.as_span(),
            format!("Invalid value: \"{}\"", pair.as_str()),
        ));
    }
    Ok(value as u64)
}

/// An operand pair as either an integer or a symbol reference.
pub fn process_value(pair: &Pair<Rule>) -> Result<Value> {
    if pair.as_rule() == Rule::token {
        if let Some(value) = parse_int(pair.as_str()) {
            return Ok(Value::Int(value));
        }
        if is_symbol(pair.as_str()) {
            return Ok(Value::Symbol(pair.as_str().to_owned()));
        }
    } else if pair.as_rule() == Rule::char_lit {
        return process_int(pair).map(Value::Int);
    }
    Err(new_parser_error(
        pair.as_span(),
        format!("Invalid operand: \"{}\"", pair.as_str()),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn integer_radixes() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-42"), Some(-42));
        assert_eq!(parse_int("0x10"), Some(16));
        assert_eq!(parse_int("0X10"), Some(16));
        assert_eq!(parse_int("-0x800"), Some(-2048));
        assert_eq!(parse_int("010"), Some(8));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("0"), Some(0));
        assert_eq!(parse_int("0xFFFFFFFF"), Some(0xFFFF_FFFF));
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("4x"), None);
        assert_eq!(parse_int("0x"), None);
    }

    #[test]
    fn character_literals() {
        assert_eq!(parse_char("a"), Some(b'a'));
        assert_eq!(parse_char("\\n"), Some(b'\n'));
        assert_eq!(parse_char("\\0"), Some(0));
        assert_eq!(parse_char("\\x41"), Some(b'A'));
        assert_eq!(parse_char("ab"), None);
        assert_eq!(parse_char("\\q"), None);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(unescape_string("hi\\n").unwrap(), b"hi\n".to_vec());
        assert_eq!(
            unescape_string("a\\tb\\\\c\\\"d").unwrap(),
            b"a\tb\\c\"d".to_vec()
        );
        assert_eq!(unescape_string("\\x00x").unwrap(), vec![0, b'x']);
        assert!(unescape_string("bad\\q").is_err());
        assert!(unescape_string("trailing\\").is_err());
    }

    #[test]
    fn symbol_shapes() {
        assert!(is_symbol("main"));
        assert!(is_symbol(".L0"));
        assert!(is_symbol("_start$x.1"));
        assert!(!is_symbol("9lives"));
        assert!(!is_symbol("a-b"));
        assert!(!is_symbol(""));
    }
}
