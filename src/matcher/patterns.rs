use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CardError, Result};
use crate::signatures::{VariableValue, Variables};
use crate::types::BLOCK_SIZE;

/// Byte pattern with wildcard positions, anchored at the start of the data.
///
/// Text syntax, whitespace separated:
/// - `4A` one literal byte (hex)
/// - `??` any single byte
/// - `*N` N arbitrary bytes
/// - `"text"` ASCII literal
/// - `{name}` / `{name:W}` variable slot (W = 1, 2 or 4 for numbers)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern {
    cells: Vec<Option<u8>>,
}

impl BytePattern {
    /// Exact byte sequence
    pub fn literal(bytes: &[u8]) -> Self {
        Self {
            cells: bytes.iter().copied().map(Some).collect(),
        }
    }

    /// Parse pattern text, resolving variable slots
    pub fn parse(text: &str, variables: &Variables) -> Result<Self> {
        let mut cells = Vec::new();
        let mut chars = text.char_indices().peekable();

        while let Some(&(start, c)) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
                continue;
            }

            match c {
                '"' => {
                    chars.next();
                    let mut closed = false;
                    for (_, ch) in chars.by_ref() {
                        if ch == '"' {
                            closed = true;
                            break;
                        }
                        if !ch.is_ascii() {
                            return Err(CardError::Pattern(format!(
                                "non-ASCII character {:?} in literal at {}",
                                ch, start
                            )));
                        }
                        cells.push(Some(ch as u8));
                    }
                    if !closed {
                        return Err(CardError::Pattern(format!("unterminated literal at {}", start)));
                    }
                }
                '{' => {
                    let mut body = String::new();
                    chars.next();
                    let mut closed = false;
                    for (_, ch) in chars.by_ref() {
                        if ch == '}' {
                            closed = true;
                            break;
                        }
                        body.push(ch);
                    }
                    if !closed {
                        return Err(CardError::Pattern(format!("unterminated variable at {}", start)));
                    }
                    let bytes = resolve_slot(&body, variables)?;
                    cells.extend(bytes.into_iter().map(Some));
                }
                _ => {
                    let mut token = String::new();
                    while let Some(&(_, ch)) = chars.peek() {
                        if ch.is_whitespace() || ch == '"' || ch == '{' {
                            break;
                        }
                        token.push(ch);
                        chars.next();
                    }
                    push_token(&token, &mut cells)?;
                }
            }
        }

        if cells.is_empty() {
            return Err(CardError::Pattern("pattern is empty".to_string()));
        }
        if cells.iter().all(Option::is_none) {
            return Err(CardError::Pattern("pattern has no fixed bytes".to_string()));
        }
        Ok(Self { cells })
    }

    /// Bytes of input the pattern needs
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// True when `data` starts with bytes matching every cell
    #[inline]
    pub fn matches_at_start(&self, data: &[u8]) -> bool {
        if data.len() < self.cells.len() {
            return false;
        }
        self.cells
            .iter()
            .zip(data)
            .all(|(cell, &byte)| cell.map_or(true, |expected| expected == byte))
    }
}

fn push_token(token: &str, cells: &mut Vec<Option<u8>>) -> Result<()> {
    if token == "??" {
        cells.push(None);
        return Ok(());
    }

    if let Some(count) = token.strip_prefix('*') {
        let count: usize = count
            .parse()
            .map_err(|_| CardError::Pattern(format!("invalid span {:?}", token)))?;
        if count == 0 || count > BLOCK_SIZE {
            return Err(CardError::Pattern(format!("span {:?} out of range", token)));
        }
        cells.extend(std::iter::repeat(None).take(count));
        return Ok(());
    }

    if token.len() == 2 {
        if let Ok(byte) = u8::from_str_radix(token, 16) {
            cells.push(Some(byte));
            return Ok(());
        }
    }

    Err(CardError::Pattern(format!("unrecognised token {:?}", token)))
}

/// Resolve `name` or `name:W` against the variable table
fn resolve_slot(body: &str, variables: &Variables) -> Result<Vec<u8>> {
    let (name, width) = match body.split_once(':') {
        Some((name, width)) => {
            let width: usize = width
                .parse()
                .map_err(|_| CardError::Pattern(format!("invalid width in {{{}}}", body)))?;
            (name, Some(width))
        }
        None => (body, None),
    };

    let value = variables
        .get(name)
        .ok_or_else(|| CardError::Pattern(format!("unknown variable {:?}", name)))?;

    match (value, width) {
        (VariableValue::Bytes(bytes), None) => Ok(bytes.clone()),
        (VariableValue::Bytes(_), Some(_)) => Err(CardError::Pattern(format!(
            "variable {:?} holds bytes and takes no width",
            name
        ))),
        (VariableValue::Number(n), Some(width)) => encode_number(*n, width)
            .ok_or_else(|| CardError::Pattern(format!("{} does not fit in {} bytes", n, width))),
        (VariableValue::Number(_), None) => Err(CardError::Pattern(format!(
            "numeric variable {:?} needs a width, e.g. {{{}:2}}",
            name, name
        ))),
    }
}

fn encode_number(value: u64, width: usize) -> Option<Vec<u8>> {
    if !matches!(width, 1 | 2 | 4) {
        return None;
    }
    if width < 8 && value >> (width * 8) != 0 {
        return None;
    }
    let bytes = value.to_be_bytes();
    Some(bytes[8 - width..].to_vec())
}

fn slot_regex() -> &'static Regex {
    static SLOT_REGEX: OnceLock<Regex> = OnceLock::new();
    SLOT_REGEX.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?::[0-9]+)?)\}").expect("slot pattern is valid")
    })
}

/// Rewrite every `{name}` / `{name:W}` slot in `text` through `render`
fn substitute_slots<F>(text: &str, variables: &Variables, mut render: F) -> Result<String>
where
    F: FnMut(&[u8], &mut String) -> Result<()>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in slot_regex().captures_iter(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        render(&resolve_slot(body.as_str(), variables)?, &mut out)?;
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Replace slots in regex text with escaped bytes.
///
/// Counted repetitions such as `{3}` or `{2,4}` are left alone because
/// variable names must start with a letter or underscore.
pub fn substitute_regex(text: &str, variables: &Variables) -> Result<String> {
    substitute_slots(text, variables, |bytes, out| {
        for byte in bytes {
            out.push_str(&format!("\\x{:02X}", byte));
        }
        Ok(())
    })
}

/// Replace slots in plain text (game ids, filenames); values must be ASCII
pub fn substitute_text(text: &str, variables: &Variables) -> Result<String> {
    substitute_slots(text, variables, |bytes, out| {
        if !bytes.is_ascii() {
            return Err(CardError::Pattern(format!(
                "variable bytes {:02X?} are not ASCII text",
                bytes
            )));
        }
        out.extend(bytes.iter().map(|&b| b as char));
        Ok(())
    })
}
