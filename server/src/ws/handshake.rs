//! Registration handshake: decoding the first message a client sends.
//!
//! The only accepted first message is `{"type":"register","userId":"<id>"}`.
//! Any decode failure, tag mismatch, or empty id is a uniform rejection.

use axum::extract::ws::Message;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Messages a client may send before it is registered.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandshakeMessage {
    Register {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed registration message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("registration message is not valid UTF-8")]
    NotUtf8,
    #[error("registration message has an empty userId")]
    EmptyUserId,
    #[error("no registration received within {0:?}")]
    Timeout(Duration),
    #[error("peer disconnected before registering")]
    Disconnected,
    #[error("transport error before registration: {0}")]
    Transport(#[from] axum::Error),
}

impl HandshakeError {
    /// Protocol violations are answered by closing the connection. The other
    /// variants mean the transport is already gone and only cleanup remains.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Disconnected | Self::Transport(_))
    }
}

/// Decode a registration message and return the declared user id.
pub fn parse_registration(text: &str) -> Result<String, HandshakeError> {
    let HandshakeMessage::Register { user_id } = serde_json::from_str::<HandshakeMessage>(text)?;
    if user_id.is_empty() {
        return Err(HandshakeError::EmptyUserId);
    }
    Ok(user_id)
}

/// Interpret a data frame as a registration attempt.
/// Returns `None` for control frames, which do not count as the first message.
pub fn registration_from_frame(msg: &Message) -> Option<Result<String, HandshakeError>> {
    match msg {
        Message::Text(text) => Some(parse_registration(text.as_str())),
        Message::Binary(data) => Some(
            std::str::from_utf8(data)
                .map_err(|_| HandshakeError::NotUtf8)
                .and_then(parse_registration),
        ),
        Message::Ping(_) | Message::Pong(_) => None,
        Message::Close(_) => Some(Err(HandshakeError::Disconnected)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_registration() {
        let user_id = parse_registration(r#"{"type":"register","userId":"abc-123"}"#).unwrap();
        assert_eq!(user_id, "abc-123");
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let user_id =
            parse_registration(r#"{"userId":"u1","type":"register","client":"web"}"#).unwrap();
        assert_eq!(user_id, "u1");
    }

    #[test]
    fn test_missing_user_id_is_malformed() {
        let err = parse_registration(r#"{"type":"register"}"#).unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_empty_user_id_rejected() {
        assert!(matches!(
            parse_registration(r#"{"type":"register","userId":""}"#),
            Err(HandshakeError::EmptyUserId)
        ));
    }

    #[test]
    fn test_whitespace_user_id_is_kept_verbatim() {
        let user_id = parse_registration(r#"{"type":"register","userId":"   "}"#).unwrap();
        assert_eq!(user_id, "   ");

        let user_id = parse_registration(r#"{"type":"register","userId":" u1 "}"#).unwrap();
        assert_eq!(user_id, " u1 ");
    }

    #[test]
    fn test_wrong_or_missing_type_rejected() {
        for body in [
            r#"{"type":"hello","userId":"u1"}"#,
            r#"{"type":"Register","userId":"u1"}"#,
            r#"{"userId":"u1"}"#,
        ] {
            assert!(
                matches!(parse_registration(body), Err(HandshakeError::Malformed(_))),
                "expected rejection for {}",
                body
            );
        }
    }

    #[test]
    fn test_non_string_user_id_rejected() {
        assert!(parse_registration(r#"{"type":"register","userId":42}"#).is_err());
        assert!(parse_registration(r#"{"type":"register","userId":null}"#).is_err());
    }

    #[test]
    fn test_not_json_rejected() {
        assert!(matches!(
            parse_registration("not json"),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[test]
    fn test_binary_frame_decoded_as_utf8() {
        let frame = Message::Binary(br#"{"type":"register","userId":"bin"}"#.to_vec().into());
        assert_eq!(registration_from_frame(&frame).unwrap().unwrap(), "bin");

        let garbage = Message::Binary(vec![0xff, 0xfe, 0x00].into());
        assert!(matches!(
            registration_from_frame(&garbage),
            Some(Err(HandshakeError::NotUtf8))
        ));
    }

    #[test]
    fn test_control_frames_do_not_count() {
        assert!(registration_from_frame(&Message::Ping(vec![1].into())).is_none());
        assert!(registration_from_frame(&Message::Pong(vec![1].into())).is_none());

        let close = registration_from_frame(&Message::Close(None)).unwrap();
        let err = close.unwrap_err();
        assert!(!err.is_protocol_violation());
    }
}
