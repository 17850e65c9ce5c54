//! Reply envelope: a two element array `(error text or nil, result value)`.

use crate::codec::{decode, encode};
use crate::CodecError;
use bytes::Bytes;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;

/// A packed reply, ready to publish to the caller's reply queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    body: Bytes,
    failed: bool,
}

impl Reply {
    /// Pack a successful result as `(nil, value)`
    pub fn success<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        let body = encode(&(None::<&str>, value))?;
        Ok(Reply {
            body: Bytes::from(body),
            failed: false,
        })
    }

    /// Pack a failure as `(error_text, nil)`
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        let body = match encode(&(Some(error.as_str()), ())) {
            Ok(body) => body,
            // A string and nil always pack; keep a valid envelope regardless.
            Err(_) => vec![0x92, 0xc0, 0xc0],
        };
        Reply {
            body: Bytes::from(body),
            failed: true,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failed
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// Unpack a reply body.
///
/// The outer `Result` reports a malformed envelope, the inner one carries the
/// remote error text when the handler failed.
pub fn decode_reply<T: DeserializeOwned>(
    body: &[u8],
) -> Result<Result<T, String>, CodecError> {
    let (error, _): (Option<String>, IgnoredAny) = decode(body)?;
    if let Some(error) = error {
        return Ok(Err(error));
    }

    let (_, value): (IgnoredAny, T) = decode(body)?;
    Ok(Ok(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let reply = Reply::success(&10i64).unwrap();
        assert!(!reply.is_failure());

        let decoded: Result<i64, String> = decode_reply(reply.body()).unwrap();
        assert_eq!(decoded, Ok(10));
    }

    #[test]
    fn test_failure_envelope_ignores_result_type() {
        let reply = Reply::failure("bad input");
        assert!(reply.is_failure());

        // The result slot is nil, which would not decode as i64
        let decoded: Result<i64, String> = decode_reply(reply.body()).unwrap();
        assert_eq!(decoded, Err("bad input".to_string()));
    }

    #[test]
    fn test_wire_layout() {
        let reply = Reply::success(&1u8).unwrap();
        // fixarray(2), nil, positive fixint 1
        assert_eq!(&reply.body()[..], &[0x92, 0xc0, 0x01]);
    }

    #[test]
    fn test_malformed_envelope() {
        let body = encode(&"just a string").unwrap();
        let result = decode_reply::<i64>(&body);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_wrong_result_type() {
        let reply = Reply::success(&"text").unwrap();
        let result = decode_reply::<i64>(reply.body());
        assert!(result.is_err());
    }
}
