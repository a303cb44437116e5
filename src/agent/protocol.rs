//! Guest agent wire types.
//!
//! A request is `{"execute": <command>, "arguments": {…}}` serialised as
//! compact JSON and terminated by a single `\r\n`. There is no length
//! prefix; a reply is considered complete when the channel goes quiet.
//!
//! A reply is either `{"return": <payload>}` or
//! `{"error": {"class": …, "desc": …}}`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, Result, VmError};

pub const FRAME_DELIMITER: &[u8] = b"\r\n";

/// Outbound request frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRequest {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

impl AgentRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            execute: command.into(),
            arguments: None,
        }
    }

    pub fn with_arguments(command: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            execute: command.into(),
            arguments: Some(arguments),
        }
    }

    /// Compact JSON followed by the frame delimiter.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)?;
        buf.extend_from_slice(FRAME_DELIMITER);
        Ok(buf)
    }
}

/// Error descriptor carried by `{"error": …}` replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestErrorDescriptor {
    pub class: String,
    pub desc: String,
}

impl GuestErrorDescriptor {
    /// Each field falls back on its own when missing or not a string.
    pub fn from_value(error: &Value) -> Self {
        let field = |key: &str, default: &str| {
            error
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        Self {
            class: field("class", "UnknownClass"),
            desc: field("desc", "No Description"),
        }
    }
}

/// Parse an accumulated reply buffer into its success payload.
pub fn parse_reply(buf: &[u8]) -> Result<Value> {
    if buf.is_empty() {
        return Err(ProtocolError::Disconnected.into());
    }
    let reply: Value =
        serde_json::from_slice(buf).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if let Some(error) = reply.get("error") {
        let descriptor = GuestErrorDescriptor::from_value(error);
        return Err(VmError::Guest {
            class: descriptor.class,
            desc: descriptor.desc,
        });
    }

    match reply {
        Value::Object(mut obj) if obj.contains_key("return") => {
            Ok(obj.remove("return").unwrap_or(Value::Null))
        }
        other => Err(ProtocolError::InvalidReply(other.to_string()).into()),
    }
}

/// Shape a command promises for its success payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    Mapping,
    List,
    Integer,
    /// No payload: `null` or an empty mapping.
    Empty,
}

impl ReplyShape {
    fn name(self) -> &'static str {
        match self {
            ReplyShape::Mapping => "mapping",
            ReplyShape::List => "list",
            ReplyShape::Integer => "integer",
            ReplyShape::Empty => "empty",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ReplyShape::Mapping => value.is_object(),
            ReplyShape::List => value.is_array(),
            ReplyShape::Integer => value.is_i64() || value.is_u64(),
            ReplyShape::Empty => match value {
                Value::Null => true,
                Value::Object(obj) => obj.is_empty(),
                _ => false,
            },
        }
    }

    /// Check `value` against this shape for `command`.
    pub fn validate(self, command: &str, value: Value) -> Result<Value> {
        if self.matches(&value) {
            Ok(value)
        } else {
            Err(ProtocolError::UnexpectedShape {
                command: command.to_string(),
                expected: self.name().to_string(),
                got: describe(&value).to_string(),
            }
            .into())
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

// ---------------------------------------------------------------------------
// Typed arguments and replies
// ---------------------------------------------------------------------------

/// Arguments of `guest-exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub path: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Bytes fed to the program's stdin; sent base64-encoded.
    pub input: Option<Vec<u8>>,
    pub capture_output: Option<bool>,
}

impl ExecRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = Some(capture);
        self
    }

    pub(crate) fn into_arguments(self) -> Map<String, Value> {
        let mut arguments = Map::new();
        arguments.insert("path".into(), Value::String(self.path));
        if !self.args.is_empty() {
            arguments.insert("arg".into(), self.args.into());
        }
        if !self.env.is_empty() {
            arguments.insert("env".into(), self.env.into());
        }
        if let Some(input) = self.input {
            arguments.insert("input-data".into(), STANDARD.encode(input).into());
        }
        if let Some(capture) = self.capture_output {
            arguments.insert("capture-output".into(), capture.into());
        }
        arguments
    }
}

/// Reply of `guest-exec-status`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecStatus {
    pub exited: bool,
    #[serde(default)]
    pub exitcode: Option<i32>,
    #[serde(default)]
    pub signal: Option<i32>,
    #[serde(rename = "out-data", default)]
    pub out_data: Option<String>,
    #[serde(rename = "err-data", default)]
    pub err_data: Option<String>,
    #[serde(rename = "out-truncated", default)]
    pub out_truncated: bool,
    #[serde(rename = "err-truncated", default)]
    pub err_truncated: bool,
}

impl ExecStatus {
    /// Decoded captured stdout, if any was returned.
    pub fn stdout(&self) -> Result<Vec<u8>> {
        decode_data(self.out_data.as_deref())
    }

    pub fn stderr(&self) -> Result<Vec<u8>> {
        decode_data(self.err_data.as_deref())
    }
}

fn decode_data(data: Option<&str>) -> Result<Vec<u8>> {
    match data {
        Some(b64) => STANDARD
            .decode(b64)
            .map_err(|e| ProtocolError::Malformed(format!("bad base64 payload: {e}")).into()),
        None => Ok(Vec::new()),
    }
}

/// `whence` of `guest-file-seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn as_str(self) -> &'static str {
        match self {
            Whence::Set => "set",
            Whence::Cur => "cur",
            Whence::End => "end",
        }
    }
}

/// `mode` of `guest-shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Powerdown,
    Halt,
    Reboot,
}

impl ShutdownMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownMode::Powerdown => "powerdown",
            ShutdownMode::Halt => "halt",
            ShutdownMode::Reboot => "reboot",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_is_compact_and_crlf_terminated() {
        let bytes = AgentRequest::new("guest-ping").encode().unwrap();
        assert_eq!(bytes, b"{\"execute\":\"guest-ping\"}\r\n");
    }

    #[test]
    fn return_payload_is_unwrapped() {
        let value = parse_reply(br#"{"return": {"host-name": "x"}}"#).unwrap();
        assert_eq!(value, json!({"host-name": "x"}));
    }

    #[test]
    fn error_descriptor_becomes_guest_error() {
        let err = parse_reply(br#"{"error": {"class": "GenericError", "desc": "bad"}}"#)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("GenericError") && msg.contains("bad"), "got: {msg}");
    }

    #[test]
    fn error_descriptor_defaults() {
        match parse_reply(br#"{"error": {}}"#).unwrap_err() {
            VmError::Guest { class, desc } => {
                assert_eq!(class, "UnknownClass");
                assert_eq!(desc, "No Description");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn badly_typed_error_field_keeps_the_other() {
        match parse_reply(br#"{"error": {"class": 3, "desc": "real"}}"#).unwrap_err() {
            VmError::Guest { class, desc } => {
                assert_eq!(class, "UnknownClass");
                assert_eq!(desc, "real");
            }
            other => panic!("unexpected error: {other}"),
        }
        let descriptor = GuestErrorDescriptor::from_value(&json!("not a mapping"));
        assert_eq!(descriptor.class, "UnknownClass");
        assert_eq!(descriptor.desc, "No Description");
    }

    #[test]
    fn empty_buffer_means_disconnected() {
        assert!(matches!(
            parse_reply(b"").unwrap_err(),
            VmError::Protocol(ProtocolError::Disconnected)
        ));
    }

    #[test]
    fn other_shapes_are_invalid() {
        assert!(matches!(
            parse_reply(br#"{"event": "SHUTDOWN"}"#).unwrap_err(),
            VmError::Protocol(ProtocolError::InvalidReply(_))
        ));
        assert!(matches!(
            parse_reply(b"{not json").unwrap_err(),
            VmError::Protocol(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn shape_validation() {
        assert!(ReplyShape::List.validate("guest-get-disks", json!([])).is_ok());
        assert!(ReplyShape::Integer.validate("guest-file-open", json!(3)).is_ok());
        let err = ReplyShape::Mapping
            .validate("guest-info", json!([1, 2]))
            .unwrap_err();
        assert!(err.to_string().contains("expected mapping reply, got list"));
    }

    #[test]
    fn empty_shape_accepts_only_no_payload() {
        assert!(ReplyShape::Empty.validate("guest-shutdown", Value::Null).is_ok());
        assert!(ReplyShape::Empty.validate("guest-shutdown", json!({})).is_ok());
        let err = ReplyShape::Empty
            .validate("guest-shutdown", json!({"x": 1}))
            .unwrap_err();
        assert!(err.to_string().contains("expected empty reply, got mapping"));
    }

    #[test]
    fn exec_arguments_skip_empty_fields() {
        let args = ExecRequest::new("/bin/true").into_arguments();
        assert_eq!(Value::Object(args), json!({"path": "/bin/true"}));

        let mut req = ExecRequest::new("/bin/cat").capture_output(true);
        req.input = Some(b"hi".to_vec());
        let args = req.into_arguments();
        assert_eq!(args["input-data"], json!("aGk="));
        assert_eq!(args["capture-output"], json!(true));
    }

    #[test]
    fn exec_status_decodes_output() {
        let status: ExecStatus =
            serde_json::from_value(json!({"exited": true, "exitcode": 0, "out-data": "aGVsbG8K"}))
                .unwrap();
        assert_eq!(status.stdout().unwrap(), b"hello\n");
        assert!(status.stderr().unwrap().is_empty());
    }
}
