//! Response line builders.
//!
//! Success lines are `OK:` optionally followed by `&`-joined URL-encoded
//! `key=value` fields. Warnings ride on success lines as
//! `OK:WARNING:<kind>:<message>;<payload>`. Errors use `ERR:<kind>:<message>`.

use crate::error::{NsError, WarnKind};
use url::form_urlencoded;

/// A bare success: `OK:`.
pub fn ok_empty() -> String {
    "OK:".to_string()
}

/// Success with a pre-rendered payload: `OK:<payload>`.
pub fn ok_payload(payload: impl AsRef<str>) -> String {
    format!("OK:{}", payload.as_ref())
}

/// Success carrying `key=value` fields joined with `&`, values URL-encoded.
pub fn ok_fields<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    format!("OK:{}", encode_fields(fields))
}

/// Warning riding on a success: `OK:WARNING:<kind>:<message>;<payload>`.
pub fn ok_warning(kind: WarnKind, message: &str, payload: &str) -> String {
    format!("OK:WARNING:{}:{};{}", kind.as_str(), message, payload)
}

/// Error line: `ERR:<kind>:<message>`.
pub fn err_line(err: &NsError) -> String {
    err.to_wire()
}

/// Render `key=value` fields joined with `&`, URL-encoding each value.
pub fn encode_fields<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (name, value) in fields {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(name);
        out.push('=');
        out.extend(form_urlencoded::byte_serialize(value.as_bytes()));
    }
    out
}

/// Decode one URL-encoded field value.
pub fn decode_field(value: &str) -> String {
    form_urlencoded::parse(format!("v={}", value).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// Split an `OK:` payload of `&`-joined fields into decoded pairs.
/// Used by tests and client tooling.
pub fn parse_fields(payload: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(payload.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrKind;

    #[test]
    fn test_ok_fields_encoding() {
        let line = ok_fields([("job_key", "NSID_1_9100_h"), ("output", "a b&c")]);
        assert_eq!(line, "OK:job_key=NSID_1_9100_h&output=a+b%26c");
    }

    #[test]
    fn test_fields_roundtrip() {
        let line = encode_fields([("input", "x\ny"), ("affinity", "a=b")]);
        let parsed = parse_fields(&line);
        assert_eq!(parsed[0], ("input".to_string(), "x\ny".to_string()));
        assert_eq!(parsed[1], ("affinity".to_string(), "a=b".to_string()));
    }

    #[test]
    fn test_warning_line() {
        let line = ok_warning(WarnKind::JobAlreadyCanceled, "Already canceled", "0");
        assert_eq!(line, "OK:WARNING:eJobAlreadyCanceled:Already canceled;0");
    }

    #[test]
    fn test_err_line() {
        let line = err_line(&NsError::new(ErrKind::TryAgain, "busy"));
        assert_eq!(line, "ERR:eTryAgain:busy");
    }
}
