//! Status reports (`PUT /mdm/connect`).

use std::str::FromStr;

use serde::Deserialize;

use super::ProtocolError;

/// `Status` value of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Idle,
    Acknowledged,
    Error,
    CommandFormatError,
    NotNow,
}

impl ConnectStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Acknowledged => "Acknowledged",
            Self::Error => "Error",
            Self::CommandFormatError => "CommandFormatError",
            Self::NotNow => "NotNow",
        }
    }
}

impl FromStr for ConnectStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(Self::Idle),
            "Acknowledged" => Ok(Self::Acknowledged),
            "Error" => Ok(Self::Error),
            "CommandFormatError" => Ok(Self::CommandFormatError),
            "NotNow" => Ok(Self::NotNow),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(rename = "UDID")]
    udid: Option<String>,
    #[serde(rename = "Status")]
    status: Option<String>,
    #[serde(rename = "CommandUUID")]
    command_uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReport {
    pub udid: String,
    pub status: ConnectStatus,
    pub command_uuid: Option<String>,
}

impl ConnectReport {
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawReport =
            plist::from_bytes(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let status: ConnectStatus = raw
            .status
            .ok_or(ProtocolError::MissingField("Status"))?
            .parse()?;
        let command_uuid = raw.command_uuid.filter(|uuid| !uuid.is_empty());
        if status != ConnectStatus::Idle && command_uuid.is_none() {
            return Err(ProtocolError::MissingField("CommandUUID"));
        }

        Ok(Self {
            udid: raw.udid.ok_or(ProtocolError::MissingField("UDID"))?,
            status,
            command_uuid,
        })
    }
}
