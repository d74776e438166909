//! URL encoding of row images and attribute lists.
//!
//! Row events carry their column values as `col=val&col2=val2`. A key without `=` stands for a
//! SQL `NULL`, an empty value after `=` for the empty string. Keys and values are percent
//! encoded, with `+` accepted as an encoded space.

use std::collections::BTreeMap;

use crate::bail;
use crate::error::{CascadeResult, ErrorKind};

/// Decodes `col=val&col2` into an ordered map; `None` values are SQL `NULL`s.
pub fn decode_map(encoded: &str) -> CascadeResult<BTreeMap<String, Option<String>>> {
    let mut map = BTreeMap::new();

    for pair in encoded.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (decode_component(key)?, Some(decode_component(value)?)),
            None => (decode_component(pair)?, None),
        };
        map.insert(key, value);
    }

    Ok(map)
}

/// Encodes a map so that [`decode_map`] returns it unchanged.
pub fn encode_map<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a Option<String>)>,
{
    entries
        .into_iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{}={}", encode_component(key), encode_component(value)),
            None => encode_component(key),
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-decodes one key or value.
pub fn decode_component(component: &str) -> CascadeResult<String> {
    let bytes = component.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                let Some(hex) = bytes.get(index + 1..index + 3) else {
                    bail!(
                        ErrorKind::InvalidEventFormat,
                        "Truncated percent escape",
                        component
                    );
                };
                let Some(byte) = std::str::from_utf8(hex)
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                else {
                    bail!(ErrorKind::InvalidEventFormat, "Invalid percent escape", component);
                };
                decoded.push(byte);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    match String::from_utf8(decoded) {
        Ok(decoded) => Ok(decoded),
        Err(err) => bail!(
            ErrorKind::InvalidEventFormat,
            "Decoded value is not valid UTF-8",
            component,
            source: err
        ),
    }
}

/// Percent-encodes everything except unreserved characters.
pub fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b' ' => encoded.push('+'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
