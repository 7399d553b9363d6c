//! Text reader producing [`Value`] trees.
//!
//! Whitespace and commas separate forms; `;` starts a comment running to the
//! end of the line. Reader macros expand to two-element lists:
//! `'x` to `(quote x)`, `` `x `` to `(quasiquote x)`, `~x` to `(unquote x)`
//! and `~@x` to `(splice-unquote x)`.

use std::collections::BTreeMap;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, not_line_ending},
    combinator::{cut, opt, recognize, value},
    error::ErrorKind,
    multi::many0,
    sequence::{pair, preceded},
};

use crate::ast::{MapKey, NumberType, Value};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Characters allowed in symbols and keywords besides alphanumerics
const SYMBOL_SPECIAL_CHARS: &str = "+-*/<>=!?_$%&.|";

fn is_symbol_char(c: char) -> bool {
    c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c)
}

fn error<T>(input: &str, code: ErrorKind) -> IResult<&str, T> {
    Err(nom::Err::Error(nom::error::Error::new(input, code)))
}

fn failure<T>(input: &str, code: ErrorKind) -> IResult<&str, T> {
    Err(nom::Err::Failure(nom::error::Error::new(input, code)))
}

/// Convert nom parsing errors to structured parse errors
fn to_parse_error(input: &str, error: nom::Err<nom::error::Error<&str>>) -> Error {
    let (kind, message, rest) = match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let (kind, message) = match e.code {
                ErrorKind::TooLarge => (
                    ParseErrorKind::TooDeeplyNested,
                    format!("Expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
                ),
                ErrorKind::Count => (
                    ParseErrorKind::InvalidSyntax,
                    "Map literal requires an even number of forms".to_owned(),
                ),
                ErrorKind::Verify => (
                    ParseErrorKind::InvalidSyntax,
                    "Map keys must be strings or keywords".to_owned(),
                ),
                ErrorKind::Escaped => (
                    ParseErrorKind::InvalidSyntax,
                    "Unknown escape sequence in string".to_owned(),
                ),
                _ if e.input.is_empty() => (
                    ParseErrorKind::Incomplete,
                    "Unexpected end of input".to_owned(),
                ),
                _ => {
                    let near: String = e.input.chars().take(10).collect();
                    (
                        ParseErrorKind::InvalidSyntax,
                        format!("Invalid syntax near '{near}'"),
                    )
                }
            };
            (kind, message, e.input)
        }
        nom::Err::Incomplete(_) => (
            ParseErrorKind::Incomplete,
            "Incomplete input".to_owned(),
            "",
        ),
    };
    let consumed = &input[..input.len() - rest.len()];
    let offset = consumed.chars().count();
    Error::ParseError(ParseError::with_context(kind, message, input, offset))
}

/// Skip whitespace, commas and comments
fn skip_ws(input: &str) -> &str {
    let mut separators = many0(alt((
        value((), take_while1(|c: char| c.is_whitespace() || c == ',')),
        value((), pair(char(';'), not_line_ending)),
    )));
    let parsed: IResult<&str, Vec<()>> = separators.parse(input);
    match parsed {
        Ok((rest, _)) => rest,
        Err(_) => input,
    }
}

/// Parse a number: optional sign, digits and an optional fraction
fn parse_number(input: &str) -> IResult<&str, Value> {
    let (rest, number_str) = recognize((
        opt(alt((char('-'), char('+')))),
        digit1,
        opt(pair(char('.'), digit1)),
    ))
    .parse(input)?;

    // `123abc` is neither a number nor a symbol
    if rest.starts_with(is_symbol_char) {
        return error(input, ErrorKind::Digit);
    }
    match number_str.parse::<NumberType>() {
        Ok(n) => Ok((rest, Value::Number(n))),
        Err(_) => error(input, ErrorKind::Float),
    }
}

/// Parse a symbol, or one of the literal names `nil`, `true` and `false`
fn parse_symbol(input: &str) -> IResult<&str, Value> {
    let (rest, name) = take_while1(is_symbol_char).parse(input)?;

    let mut chars = name.chars();
    let looks_numeric = match (chars.next(), chars.next()) {
        (Some(c), _) if c.is_ascii_digit() => true,
        (Some('-' | '+'), Some(c)) => c.is_ascii_digit(),
        _ => false,
    };
    if looks_numeric {
        return error(input, ErrorKind::Alpha);
    }

    let parsed = match name {
        "nil" => Value::Nil,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::symbol(name),
    };
    Ok((rest, parsed))
}

/// Parse a keyword (`:name`)
fn parse_keyword(input: &str) -> IResult<&str, Value> {
    let (rest, name) = preceded(char(':'), take_while1(is_symbol_char)).parse(input)?;
    Ok((rest, Value::keyword(name)))
}

/// Parse a string literal
fn parse_string(input: &str) -> IResult<&str, Value> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut text = String::new();

    loop {
        let mut char_iter = remaining.chars();
        match char_iter.next() {
            Some('"') => return Ok((char_iter.as_str(), Value::String(text))),
            Some('\\') => {
                match char_iter.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some(_) => return failure(remaining, ErrorKind::Escaped),
                    None => return failure(char_iter.as_str(), ErrorKind::Char),
                }
                remaining = char_iter.as_str();
            }
            Some(ch) => {
                text.push(ch);
                remaining = char_iter.as_str();
            }
            // Reached end of input without finding closing quote
            None => return failure(remaining, ErrorKind::Char),
        }
    }
}

/// Depth of the forms inside a compound form opened at `depth`
fn nested_depth(input: &str, depth: usize) -> Result<usize, nom::Err<nom::error::Error<&str>>> {
    if depth + 1 >= MAX_PARSE_DEPTH {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::TooLarge,
        )));
    }
    Ok(depth + 1)
}

/// Parse the forms of a delimited sequence up to and including `close`
fn parse_items(input: &str, close: char, depth: usize) -> IResult<&str, Vec<Value>> {
    let depth = nested_depth(input, depth)?;
    let (input, items) = many0(|input| parse_form(skip_ws(input), depth)).parse(input)?;
    let (input, _) = cut(char(close)).parse(skip_ws(input))?;
    Ok((input, items))
}

/// Parse `( ... )`
fn parse_list(input: &str, depth: usize) -> IResult<&str, Value> {
    let (input, _) = char('(').parse(input)?;
    let (input, items) = parse_items(input, ')', depth)?;
    Ok((input, Value::list(items)))
}

/// Parse `[ ... ]`
fn parse_vector(input: &str, depth: usize) -> IResult<&str, Value> {
    let (input, _) = char('[').parse(input)?;
    let (input, items) = parse_items(input, ']', depth)?;
    Ok((input, Value::vector(items)))
}

/// Parse `{ key value ... }`; keys must be strings or keywords
fn parse_map(input: &str, depth: usize) -> IResult<&str, Value> {
    let (start, _) = char('{').parse(input)?;
    let (rest, items) = parse_items(start, '}', depth)?;
    if items.len() % 2 != 0 {
        return failure(start, ErrorKind::Count);
    }

    let mut entries = BTreeMap::new();
    for entry in items.chunks_exact(2) {
        let Ok(key) = MapKey::try_from(&entry[0]) else {
            return failure(start, ErrorKind::Verify);
        };
        entries.insert(key, entry[1].clone());
    }
    Ok((rest, Value::map(entries)))
}

/// Parse a reader macro prefix and the form it applies to
fn parse_reader_macro(input: &str, depth: usize) -> IResult<&str, Value> {
    let (input, name) = alt((
        value("splice-unquote", tag("~@")),
        value("unquote", tag("~")),
        value("quasiquote", tag("`")),
        value("quote", tag("'")),
    ))
    .parse(input)?;
    let depth = nested_depth(input, depth)?;
    let (input, form) = cut(|input| parse_form(skip_ws(input), depth)).parse(input)?;
    Ok((input, Value::list(vec![Value::symbol(name), form])))
}

/// Parse a single form at the given nesting depth
fn parse_form(input: &str, depth: usize) -> IResult<&str, Value> {
    alt((
        |input| parse_reader_macro(input, depth),
        |input| parse_list(input, depth),
        |input| parse_vector(input, depth),
        |input| parse_map(input, depth),
        parse_number,
        parse_string,
        parse_keyword,
        parse_symbol,
    ))
    .parse(input)
}

/// Parse exactly one form; anything but whitespace and comments after it is an error
pub fn parse(input: &str) -> Result<Value, Error> {
    let (rest, form) = parse_form(skip_ws(input), 0).map_err(|e| to_parse_error(input, e))?;
    let rest = skip_ws(rest);
    if !rest.is_empty() {
        let offset = input[..input.len() - rest.len()].chars().count();
        return Err(Error::ParseError(ParseError::with_context(
            ParseErrorKind::TrailingContent,
            format!("Unexpected remaining input: '{}'", rest.trim_end()),
            input,
            offset,
        )));
    }
    Ok(form)
}

/// Parse every top-level form in `input`
pub fn parse_all(input: &str) -> Result<Vec<Value>, Error> {
    let mut forms = Vec::new();
    let mut rest = skip_ws(input);
    while !rest.is_empty() {
        let (next, form) = parse_form(rest, 0).map_err(|e| to_parse_error(input, e))?;
        forms.push(form);
        rest = skip_ws(next);
    }
    Ok(forms)
}

/// Whether `input` ends inside an unfinished form (an open delimiter or string)
///
/// Interactive front ends use this to keep reading lines.
pub fn is_incomplete(input: &str) -> bool {
    matches!(
        parse_all(input),
        Err(Error::ParseError(ParseError {
            kind: ParseErrorKind::Incomplete,
            ..
        }))
    )
}
