//! Backend response envelope.
//!
//! Every backend reply has the shape
//! `{ "response": {...}, "messages": [{ "code": "0", "message": "OK" }] }`.
//! Message codes are strings on the wire but some servers send numbers.

use encore_core::{BackendError, FieldMap, GatewayResult, Record, RecordId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::constants::{CODE_NO_RECORDS, CODE_OK};

/// Raw HTTP outcome of one backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub status: u16,
    pub body: Value,
}

impl BackendReply {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// One entry of the `messages` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMessage {
    #[serde(deserialize_with = "code_as_string")]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

fn code_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Decoded backend envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub messages: Vec<BackendMessage>,
}

impl Envelope {
    /// Decode a reply, mapping an HTTP 401 to `BackendError::Unauthorized`.
    ///
    /// A 401 status whose message code is `401` means "no records match",
    /// not a rejected session, and decodes normally.
    pub fn from_reply(reply: BackendReply) -> GatewayResult<Self> {
        let status = reply.status;
        let envelope: Option<Envelope> = serde_json::from_value(reply.body.clone()).ok();

        if status == 401 {
            let no_records = envelope
                .as_ref()
                .is_some_and(|e| e.code() == CODE_NO_RECORDS);
            if !no_records {
                return Err(BackendError::Unauthorized.into());
            }
        }

        match envelope {
            Some(envelope) if !envelope.messages.is_empty() => Ok(envelope),
            _ if (200..300).contains(&status) => Err(BackendError::Malformed {
                reason: format!("missing message envelope in {} reply", status),
            }
            .into()),
            _ => Err(BackendError::Http {
                status,
                message: body_excerpt(&reply.body),
            }
            .into()),
        }
    }

    /// Primary message code.
    pub fn code(&self) -> &str {
        self.messages
            .first()
            .map(|m| m.code.as_str())
            .unwrap_or(CODE_OK)
    }

    pub fn message(&self) -> &str {
        self.messages
            .first()
            .map(|m| m.message.as_str())
            .unwrap_or_default()
    }

    pub fn is_ok(&self) -> bool {
        self.code() == CODE_OK
    }

    pub fn is_no_records(&self) -> bool {
        self.code() == CODE_NO_RECORDS
    }

    /// The `response` object, or the backend's rejection.
    pub fn into_response(self) -> GatewayResult<Value> {
        if self.is_ok() {
            Ok(self.response)
        } else {
            Err(self.rejection().into())
        }
    }

    pub fn rejection(&self) -> BackendError {
        BackendError::Rejected {
            code: self.code().to_string(),
            message: self.message().to_string(),
        }
    }

    /// Build a success envelope.
    pub fn ok(response: Value) -> Self {
        Self {
            response,
            messages: vec![BackendMessage {
                code: CODE_OK.to_string(),
                message: "OK".to_string(),
            }],
        }
    }

    /// Build an error envelope.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            response: Value::Object(Default::default()),
            messages: vec![BackendMessage {
                code: code.into(),
                message: message.into(),
            }],
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn body_excerpt(body: &Value) -> String {
    let text = match body {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    text.chars().take(200).collect()
}

// ============================================================================
// RESPONSE PAYLOADS
// ============================================================================

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn malformed(reason: impl Into<String>) -> BackendError {
    BackendError::Malformed {
        reason: reason.into(),
    }
}

/// Parse `response.data[]` into records.
pub fn parse_records(response: &Value) -> GatewayResult<Vec<Record>> {
    let Some(rows) = response.get("data") else {
        return Ok(Vec::new());
    };
    let rows = rows
        .as_array()
        .ok_or_else(|| malformed("response.data is not an array"))?;
    rows.iter().map(parse_record).collect()
}

fn parse_record(row: &Value) -> GatewayResult<Record> {
    let record_id = row
        .get("recordId")
        .and_then(id_text)
        .ok_or_else(|| malformed("record row without recordId"))?;
    let fields: FieldMap = match row.get("fieldData") {
        Some(Value::Object(map)) => map.clone(),
        None | Some(Value::Null) => FieldMap::new(),
        Some(_) => return Err(malformed("fieldData is not an object").into()),
    };
    Ok(Record {
        record_id: RecordId::new(record_id),
        mod_id: row.get("modId").and_then(id_text),
        fields,
    })
}

/// Parse `response.recordId` from a create reply.
pub fn parse_record_id(response: &Value) -> GatewayResult<RecordId> {
    response
        .get("recordId")
        .and_then(id_text)
        .map(RecordId::new)
        .ok_or_else(|| malformed("create reply without recordId").into())
}

/// Parse `response.token` from a login reply.
pub fn parse_token(response: &Value) -> GatewayResult<String> {
    response
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed("login reply without token").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::GatewayError;
    use serde_json::json;

    #[test]
    fn test_ok_envelope() {
        let reply = BackendReply::new(
            200,
            json!({ "response": { "recordId": "12", "modId": "0" }, "messages": [{ "code": "0", "message": "OK" }] }),
        );
        let envelope = Envelope::from_reply(reply).expect("decodes");
        assert!(envelope.is_ok());
        let response = envelope.into_response().expect("ok");
        assert_eq!(parse_record_id(&response), Ok(RecordId::new("12")));
    }

    #[test]
    fn test_numeric_codes_are_accepted() {
        let reply = BackendReply::new(
            500,
            json!({ "response": {}, "messages": [{ "code": 102, "message": "Field is missing" }] }),
        );
        let envelope = Envelope::from_reply(reply).expect("decodes");
        assert_eq!(envelope.code(), "102");
        let err = envelope.into_response().expect_err("rejected");
        assert_eq!(err.backend_code(), Some("102"));
    }

    #[test]
    fn test_http_401_is_unauthorized() {
        let reply = BackendReply::new(
            401,
            json!({ "response": {}, "messages": [{ "code": "952", "message": "Invalid token" }] }),
        );
        assert_eq!(
            Envelope::from_reply(reply),
            Err(GatewayError::Backend(BackendError::Unauthorized))
        );

        let bare = BackendReply::new(401, Value::Null);
        assert_eq!(
            Envelope::from_reply(bare),
            Err(GatewayError::Backend(BackendError::Unauthorized))
        );
    }

    #[test]
    fn test_http_401_with_no_records_code_is_not_unauthorized() {
        let reply = BackendReply::new(401, Envelope::error("401", "No records match").to_value());
        let envelope = Envelope::from_reply(reply).expect("decodes");
        assert!(envelope.is_no_records());
    }

    #[test]
    fn test_non_envelope_error_body() {
        let reply = BackendReply::new(502, Value::String("<html>Bad Gateway</html>".to_string()));
        match Envelope::from_reply(reply) {
            Err(GatewayError::Backend(BackendError::Http { status, message })) => {
                assert_eq!(status, 502);
                assert!(message.contains("Bad Gateway"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_records() {
        let response = json!({
            "data": [
                { "recordId": "1", "modId": "3", "fieldData": { "SessionID": "s", "PositionSec": 12 } },
                { "recordId": 2, "fieldData": {} }
            ]
        });
        let records = parse_records(&response).expect("parses");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mod_id.as_deref(), Some("3"));
        assert_eq!(records[0].number("PositionSec"), Some(12.0));
        assert_eq!(records[1].record_id, RecordId::new("2"));

        assert_eq!(parse_records(&json!({})), Ok(Vec::new()));
        assert!(parse_records(&json!({ "data": [{ "fieldData": {} }] })).is_err());
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token(&json!({ "token": "abc" })), Ok("abc".to_string()));
        assert!(parse_token(&json!({ "token": "" })).is_err());
    }
}
