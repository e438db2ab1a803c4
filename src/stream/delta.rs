//! Delta decoding of data update lines.
//!
//! A data line has the shape `<table>,<item>|<f1>|<f2>|...`. Fields whose
//! value did not change since the previous update for the same item are
//! sent empty and must be carried forward from the cached value.

use crate::stream::StreamError;

/// Decoded value of one field: `None` is the protocol's null.
pub type FieldValue = Option<String>;

/// Decodes one raw field against the previously known value.
///
/// - `""` keeps `previous`.
/// - `"$"` is the empty string, `"#"` is null.
/// - A leading `$` or `#` followed by more characters is an escape marker and
///   is stripped.
pub fn decode_field(raw: &str, previous: Option<&FieldValue>) -> FieldValue {
    match raw {
        "" => previous.cloned().flatten(),
        "$" => Some(String::new()),
        "#" => None,
        _ => match raw.strip_prefix(['$', '#']) {
            Some(rest) => Some(rest.to_string()),
            None => Some(raw.to_string()),
        },
    }
}

/// Borrowed view over a data line split into its addressing and raw fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawUpdate<'a> {
    pub subscription_id: u32,
    /// 1-based item position within the subscription's item list.
    pub item_pos: usize,
    pub fields: Vec<&'a str>,
}

/// Splits a data line into table id, item position and raw field values.
pub fn parse_data_line(line: &str) -> Result<RawUpdate<'_>, StreamError> {
    let (table, rest) = line
        .split_once(',')
        .ok_or_else(|| StreamError::Protocol(format!("data line without table id: {line}")))?;
    let subscription_id = table
        .trim()
        .parse::<u32>()
        .map_err(|_| StreamError::Protocol(format!("invalid table id in data line: {line}")))?;

    let mut parts = rest.split('|');
    let item_pos = parts
        .next()
        .and_then(|pos| pos.trim().parse::<usize>().ok())
        .filter(|pos| *pos > 0)
        .ok_or_else(|| StreamError::Protocol(format!("invalid item position in data line: {line}")))?;

    Ok(RawUpdate {
        subscription_id,
        item_pos,
        fields: parts.collect(),
    })
}
