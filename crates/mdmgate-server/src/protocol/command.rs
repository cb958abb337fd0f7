//! Command payloads and the envelope delivered to devices.

use plist::{Dictionary, Value};

use super::ProtocolError;

/// Build the XML plist of a `Command` dictionary from an operator's JSON
/// payload. `RequestType` always comes from `request_type`.
pub fn command_from_json(
    request_type: &str,
    payload: &serde_json::Value,
) -> Result<Vec<u8>, ProtocolError> {
    let mut command = match payload {
        serde_json::Value::Null => Dictionary::new(),
        serde_json::Value::Object(_) => match json_to_plist(payload)? {
            Value::Dictionary(dict) => dict,
            _ => Dictionary::new(),
        },
        _ => {
            return Err(ProtocolError::InvalidPayload(
                "payload must be a JSON object".into(),
            ));
        }
    };
    command.insert("RequestType".into(), Value::String(request_type.to_string()));

    let mut xml = Vec::new();
    Value::Dictionary(command)
        .to_writer_xml(&mut xml)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    Ok(xml)
}

/// Wrap a stored command payload for delivery: `{CommandUUID, Command}`.
pub fn command_envelope(uuid: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let command =
        Value::from_reader_xml(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let mut envelope = Dictionary::new();
    envelope.insert("CommandUUID".into(), Value::String(uuid.to_string()));
    envelope.insert("Command".into(), command);

    let mut xml = Vec::new();
    Value::Dictionary(envelope)
        .to_writer_xml(&mut xml)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(xml)
}

fn json_to_plist(value: &serde_json::Value) -> Result<Value, ProtocolError> {
    Ok(match value {
        serde_json::Value::Null => {
            return Err(ProtocolError::InvalidPayload(
                "null has no property list representation".into(),
            ));
        }
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i.into())
            } else if let Some(u) = n.as_u64() {
                Value::Integer(u.into())
            } else {
                Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_plist).collect::<Result<_, _>>()?)
        }
        serde_json::Value::Object(map) => {
            let mut dict = Dictionary::new();
            for (key, item) in map {
                dict.insert(key.clone(), json_to_plist(item)?);
            }
            Value::Dictionary(dict)
        }
    })
}
