//! Check-in messages (`PUT /mdm/checkin`).

use serde::Deserialize;

use super::ProtocolError;

#[derive(Debug, Deserialize)]
struct RawCheckin {
    #[serde(rename = "MessageType")]
    message_type: String,
    #[serde(rename = "UDID")]
    udid: Option<String>,
    #[serde(rename = "Topic")]
    topic: Option<String>,
    #[serde(rename = "SerialNumber")]
    serial_number: Option<String>,
    #[serde(rename = "Token")]
    token: Option<plist::Data>,
    #[serde(rename = "PushMagic")]
    push_magic: Option<String>,
}

/// A device check-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckinMessage {
    Authenticate {
        udid: String,
        topic: String,
        serial_number: Option<String>,
    },
    TokenUpdate {
        udid: String,
        topic: Option<String>,
        token: Vec<u8>,
        push_magic: String,
    },
    CheckOut {
        udid: String,
    },
}

impl CheckinMessage {
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawCheckin =
            plist::from_bytes(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let udid = raw.udid.ok_or(ProtocolError::MissingField("UDID"))?;

        match raw.message_type.as_str() {
            "Authenticate" => Ok(Self::Authenticate {
                udid,
                topic: raw.topic.ok_or(ProtocolError::MissingField("Topic"))?,
                serial_number: raw.serial_number,
            }),
            "TokenUpdate" => Ok(Self::TokenUpdate {
                udid,
                topic: raw.topic,
                token: raw
                    .token
                    .map(Vec::from)
                    .ok_or(ProtocolError::MissingField("Token"))?,
                push_magic: raw
                    .push_magic
                    .ok_or(ProtocolError::MissingField("PushMagic"))?,
            }),
            "CheckOut" => Ok(Self::CheckOut { udid }),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }

    pub fn udid(&self) -> &str {
        match self {
            Self::Authenticate { udid, .. }
            | Self::TokenUpdate { udid, .. }
            | Self::CheckOut { udid } => udid,
        }
    }

    pub const fn is_authenticate(&self) -> bool {
        matches!(self, Self::Authenticate { .. })
    }

    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "Authenticate",
            Self::TokenUpdate { .. } => "TokenUpdate",
            Self::CheckOut { .. } => "CheckOut",
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn plist_body(entries: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0"><dict>{entries}</dict></plist>"#
        )
        .into_bytes()
    }

    #[test]
    fn parses_authenticate() {
        let body = plist_body(
            "<key>MessageType</key><string>Authenticate</string>
             <key>UDID</key><string>udid-1</string>
             <key>Topic</key><string>com.apple.mgmt.x</string>
             <key>SerialNumber</key><string>C02ABC</string>
             <key>Model</key><string>MacBookPro18,1</string>",
        );
        let msg = CheckinMessage::parse(&body).unwrap();
        assert!(msg.is_authenticate());
        assert_eq!(
            msg,
            CheckinMessage::Authenticate {
                udid: "udid-1".into(),
                topic: "com.apple.mgmt.x".into(),
                serial_number: Some("C02ABC".into()),
            }
        );
    }

    #[test]
    fn parses_token_update_data() {
        let body = plist_body(
            "<key>MessageType</key><string>TokenUpdate</string>
             <key>UDID</key><string>udid-1</string>
             <key>Token</key><data>AQID</data>
             <key>PushMagic</key><string>magic</string>",
        );
        let CheckinMessage::TokenUpdate {
            token, push_magic, ..
        } = CheckinMessage::parse(&body).unwrap()
        else {
            panic!("expected TokenUpdate");
        };
        assert_eq!(token, vec![1, 2, 3]);
        assert_eq!(push_magic, "magic");
    }

    #[test]
    fn rejects_unknown_and_incomplete_messages() {
        let unknown = plist_body(
            "<key>MessageType</key><string>SetBootstrapToken</string>
             <key>UDID</key><string>udid-1</string>",
        );
        assert!(matches!(
            CheckinMessage::parse(&unknown),
            Err(ProtocolError::UnknownMessageType(_))
        ));

        let missing = plist_body("<key>MessageType</key><string>CheckOut</string>");
        assert!(matches!(
            CheckinMessage::parse(&missing),
            Err(ProtocolError::MissingField("UDID"))
        ));

        assert!(matches!(
            CheckinMessage::parse(b"not a plist"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
