//! Prometheus exposition text format.

use crate::codec::{format_value, parse_value, Decoded, DecodedSample};
use crate::error::{Error, Result};
use crate::storage::{Labels, METRIC_NAME_LABEL};

/// Decode an exposition document.
///
/// `# HELP` lines are collected, `# TYPE` and other comments are ignored.
pub fn decode(input: &str) -> Result<Decoded> {
    let mut decoded = Decoded::default();

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            if let Some(rest) = comment.trim_start().strip_prefix("HELP ") {
                let rest = rest.trim_start();
                let (name, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                decoded.help.push((name.to_string(), unescape_help(text.trim_start())));
            }
            continue;
        }

        decoded.samples.push(parse_sample_line(line).map_err(|msg| Error::input(line_no, msg))?);
    }

    Ok(decoded)
}

/// Parse a line like: name{a="b",c="d"} 1.5 1700000000000
fn parse_sample_line(line: &str) -> std::result::Result<DecodedSample, String> {
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace()).unwrap_or(line.len());
    let name = &line[..name_end];
    if !is_valid_metric_name(name) {
        return Err(format!("invalid metric name {name:?}"));
    }

    let mut labels = Labels::new();
    labels.insert(METRIC_NAME_LABEL, name);

    let mut rest = &line[name_end..];
    if rest.starts_with('{') {
        let consumed = parse_label_block(rest, &mut labels)?;
        rest = &rest[consumed..];
    }

    let mut fields = rest.split_whitespace();
    let value_str = fields.next().ok_or_else(|| "missing sample value".to_string())?;
    let value = parse_value(value_str).ok_or_else(|| format!("invalid value {value_str:?}"))?;
    let timestamp = fields
        .next()
        .map(|ts| ts.parse::<i64>().map_err(|_| format!("invalid timestamp {ts:?}")))
        .transpose()?;
    if let Some(extra) = fields.next() {
        return Err(format!("unexpected trailing field {extra:?}"));
    }

    Ok(DecodedSample { labels, value, timestamp })
}

/// Parse `{a="b",...}` at the start of `input` into `labels` and return the
/// number of bytes consumed, closing brace included.
fn parse_label_block(input: &str, labels: &mut Labels) -> std::result::Result<usize, String> {
    let mut chars = input.char_indices().skip(1).peekable();

    loop {
        // Skip separators and whitespace before the next label name.
        while let Some(&(_, c)) = chars.peek() {
            if c == ',' || c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }

        let Some(&(start, c)) = chars.peek() else {
            return Err("unterminated label set".to_string());
        };
        if c == '}' {
            return Ok(start + 1);
        }

        let mut end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let name = &input[start..end];
        if name.is_empty() {
            return Err(format!("invalid label name at offset {start}"));
        }

        while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            chars.next();
        }
        if chars.next().map(|(_, c)| c) != Some('=') {
            return Err(format!("expected '=' after label {name:?}"));
        }
        while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            chars.next();
        }
        if chars.next().map(|(_, c)| c) != Some('"') {
            return Err(format!("expected quoted value for label {name:?}"));
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some((_, c)) = chars.next() {
            match c {
                '\\' => match chars.next().map(|(_, c)| c) {
                    Some('n') => value.push('\n'),
                    Some(other) => value.push(other),
                    None => break,
                },
                '"' => {
                    closed = true;
                    break;
                }
                _ => value.push(c),
            }
        }
        if !closed {
            return Err(format!("unterminated value for label {name:?}"));
        }
        labels.insert(name, value);
    }
}

pub(crate) fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn unescape_help(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn escape_help(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Append one metric family to `out`: an optional `# HELP` line followed by
/// one line per sample.
pub fn encode_metric<'a>(
    out: &mut String,
    name: &str,
    help: Option<&str>,
    samples: impl IntoIterator<Item = (&'a Labels, f64, i64)>,
) {
    if let Some(help) = help {
        out.push_str(&format!("# HELP {name} {}\n", escape_help(help)));
    }
    for (labels, value, timestamp) in samples {
        out.push_str(&format!("{name}{} {} {timestamp}\n", labels.braces(), format_value(value)));
    }
}
