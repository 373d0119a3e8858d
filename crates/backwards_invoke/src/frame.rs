//! Line-delimited JSON frames exchanged with the plugin daemon.
//!
//! Every frame is one JSON object terminated by `\n`. Outbound frames carry
//! backwards requests and heartbeats; inbound frames carry responses to those
//! requests and calls the daemon makes into the plugin.
//!
//! ```ignore
//! use backwards_invoke::frame::{InvokeRequest, OutboundFrame};
//! use backwards_invoke::InvokeType;
//! use serde_json::json;
//!
//! let req = InvokeRequest::new("9f2c", InvokeType::Storage, json!({"opt": "get", "key": "k"}));
//! let line = OutboundFrame::invoke(Some("session-1"), &req)?.to_line()?;
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::kind::InvokeType;

/// Correlates a backwards request with its response frames.
pub type RequestId = String;

/// Tag of the envelope wrapping an invocation inside a `session` frame.
pub const INVOKE_ENVELOPE: &str = "invoke";

// -----------------------------------------------------------------------------
// Outbound: plugin -> daemon
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundEvent {
    Session,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub session_id: Option<String>,
    pub event: OutboundEvent,
    pub data: Value,
}

/// The body of a backwards request: which kind, which id, what payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    #[serde(rename = "type")]
    pub kind: InvokeType,
    pub backwards_request_id: RequestId,
    pub request: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct InvokeEnvelope {
    #[serde(rename = "type")]
    tag: String,
    data: InvokeRequest,
}

impl InvokeRequest {
    pub fn new(id: impl Into<RequestId>, kind: InvokeType, request: Value) -> Self {
        Self {
            kind,
            backwards_request_id: id.into(),
            request,
        }
    }
}

impl OutboundFrame {
    /// Wrap a backwards request in a `session` frame.
    pub fn invoke(session_id: Option<&str>, req: &InvokeRequest) -> serde_json::Result<Self> {
        let envelope = InvokeEnvelope {
            tag: INVOKE_ENVELOPE.to_owned(),
            data: req.clone(),
        };
        Ok(Self {
            session_id: session_id.map(str::to_owned),
            event: OutboundEvent::Session,
            data: serde_json::to_value(envelope)?,
        })
    }

    pub fn heartbeat() -> Self {
        Self {
            session_id: None,
            event: OutboundEvent::Heartbeat,
            data: json!({}),
        }
    }

    /// Serialise as a single `\n`-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Extract the backwards request, if this is an invoke frame.
    pub fn invoke_request(&self) -> Option<InvokeRequest> {
        if self.event != OutboundEvent::Session {
            return None;
        }
        serde_json::from_value::<InvokeEnvelope>(self.data.clone())
            .ok()
            .filter(|env| env.tag == INVOKE_ENVELOPE)
            .map(|env| env.data)
    }
}

// -----------------------------------------------------------------------------
// Inbound: daemon -> plugin
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundEvent {
    /// The daemon invokes the plugin (tool call, model call, ...).
    Request,
    /// A chunk answering one of our backwards requests.
    BackwardsResponse,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub session_id: Option<String>,
    pub event: InboundEvent,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseEvent {
    Response,
    Error,
    End,
}

/// One response chunk for a backwards request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackwardsResponse {
    pub backwards_request_id: RequestId,
    pub event: ResponseEvent,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// What one response frame means for the stream it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Item(Value),
    End,
    /// The daemon reported an error; carries its message.
    Failed(String),
}

impl BackwardsResponse {
    pub fn response(id: impl Into<RequestId>, data: Value) -> Self {
        Self {
            backwards_request_id: id.into(),
            event: ResponseEvent::Response,
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn end(id: impl Into<RequestId>) -> Self {
        Self {
            backwards_request_id: id.into(),
            event: ResponseEvent::End,
            message: String::new(),
            data: None,
        }
    }

    pub fn error(id: impl Into<RequestId>, message: impl Into<String>) -> Self {
        Self {
            backwards_request_id: id.into(),
            event: ResponseEvent::Error,
            message: message.into(),
            data: None,
        }
    }

    /// No further frames follow this one. A `response` without data closes
    /// the stream as well.
    pub fn is_terminal(&self) -> bool {
        match self.event {
            ResponseEvent::Response => self.data.is_none(),
            ResponseEvent::Error | ResponseEvent::End => true,
        }
    }

    pub fn into_reply(self) -> Reply {
        match (self.event, self.data) {
            (ResponseEvent::Response, Some(data)) => Reply::Item(data),
            (ResponseEvent::Response, None) | (ResponseEvent::End, _) => Reply::End,
            (ResponseEvent::Error, _) => Reply::Failed(self.message),
        }
    }
}

impl InboundFrame {
    pub fn backwards_response(
        session_id: Option<&str>,
        rsp: &BackwardsResponse,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            session_id: session_id.map(str::to_owned),
            event: InboundEvent::BackwardsResponse,
            data: serde_json::to_value(rsp)?,
        })
    }

    pub fn request(session_id: Option<&str>, data: Value) -> Self {
        Self {
            session_id: session_id.map(str::to_owned),
            event: InboundEvent::Request,
            data,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_frame_layout() {
        let req = InvokeRequest::new("abc", InvokeType::Storage, json!({"opt": "get", "key": "k"}));
        let frame = OutboundFrame::invoke(Some("s-1"), &req).unwrap();
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["event"], "session");
        assert_eq!(v["session_id"], "s-1");
        assert_eq!(v["data"]["type"], "invoke");
        assert_eq!(v["data"]["data"]["type"], "storage");
        assert_eq!(v["data"]["data"]["backwards_request_id"], "abc");
        assert_eq!(v["data"]["data"]["request"]["key"], "k");
        assert_eq!(frame.invoke_request(), Some(req));
    }

    #[test]
    fn heartbeat_is_one_line() {
        let line = OutboundFrame::heartbeat().to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let v: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v["event"], "heartbeat");
        assert!(v["session_id"].is_null());
        assert!(OutboundFrame::heartbeat().invoke_request().is_none());
    }

    #[test]
    fn replies_follow_the_event() {
        assert_eq!(BackwardsResponse::response("r", json!(1)).into_reply(), Reply::Item(json!(1)));
        assert_eq!(BackwardsResponse::end("r").into_reply(), Reply::End);
        let mut empty = BackwardsResponse::response("r", json!(null));
        empty.data = None;
        assert_eq!(empty.into_reply(), Reply::End);
        assert_eq!(
            BackwardsResponse::error("r", "boom").into_reply(),
            Reply::Failed("boom".into())
        );
    }

    #[test]
    fn parse_backwards_response() {
        let line = r#"{"session_id":"s","event":"backwards_response","data":{"backwards_request_id":"r1","event":"response","message":"","data":{"data":"ok"}}}"#;
        let frame: InboundFrame = serde_json::from_str(line).unwrap();
        assert_eq!(frame.event, InboundEvent::BackwardsResponse);
        let rsp: BackwardsResponse = serde_json::from_value(frame.data).unwrap();
        assert_eq!(rsp.backwards_request_id, "r1");
        assert_eq!(rsp.data, Some(json!({"data": "ok"})));
        assert!(!rsp.is_terminal());
    }

    #[test]
    fn unknown_events_do_not_fail_parsing() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"event":"something_new","data":{}}"#).unwrap();
        assert_eq!(frame.event, InboundEvent::Unknown);
        assert!(frame.session_id.is_none());
    }

    #[test]
    fn terminal_events() {
        assert!(BackwardsResponse::end("r").is_terminal());
        assert!(BackwardsResponse::error("r", "nope").is_terminal());
        let mut rsp = BackwardsResponse::response("r", json!({}));
        assert!(!rsp.is_terminal());
        rsp.data = None;
        assert!(rsp.is_terminal());
    }
}
