//! MDM wire protocol: property list messages exchanged with devices.

mod checkin;
mod command;
mod connect;

pub use checkin::CheckinMessage;
pub use command::{command_envelope, command_from_json};
pub use connect::{ConnectReport, ConnectStatus};

/// Content type of device responses.
pub const PLIST_CONTENT_TYPE: &str = "application/xml";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed property list: {0}")]
    Malformed(String),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("unknown message type {0}")]
    UnknownMessageType(String),

    #[error("unknown status {0}")]
    UnknownStatus(String),

    #[error("invalid command payload: {0}")]
    InvalidPayload(String),
}
