//! Keyed byte storage hosted by the daemon.
//!
//! Values travel as lowercase hex; status replies are the string `"ok"`.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{InvokeError, Result};
use crate::invocation::BackwardsInvocation;
use crate::kind::InvokeType;
use crate::session::Session;

const STATUS_OK: &str = "ok";

/// Reply element for every storage operation.
#[derive(Debug, Clone, Deserialize)]
struct StorageReply {
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone)]
pub struct StorageInvocation {
    inner: BackwardsInvocation,
}

impl StorageInvocation {
    pub fn new(session: Session, session_id: Option<String>) -> Self {
        Self::with_invocation(BackwardsInvocation::new(session, session_id))
    }

    /// Over an existing invocation, duplex or serverless.
    pub fn with_invocation(inner: BackwardsInvocation) -> Self {
        Self { inner }
    }

    async fn call(&self, payload: Value) -> Result<Option<Value>> {
        let reply = self
            .inner
            .invoke_single::<StorageReply>(InvokeType::Storage, payload)
            .await?;
        Ok(reply.map(|r| r.data))
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let payload = json!({"opt": "set", "key": key, "value": hex::encode(value)});
        match self.call(payload).await? {
            Some(data) => expect_ok(data),
            None => Err(InvokeError::NoResponse { kind: InvokeType::Storage }),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let Some(data) = self.call(json!({"opt": "get", "key": key})).await? else {
            return Err(InvokeError::NotFound(key.to_owned()));
        };
        let Value::String(encoded) = data else {
            return Err(InvokeError::Protocol(format!(
                "storage get for {key:?} returned non-string data"
            )));
        };
        let bytes = hex::decode(&encoded)
            .map_err(|e| InvokeError::Protocol(format!("storage get for {key:?}: bad hex: {e}")))?;
        debug!(key, len = bytes.len(), "storage get");
        Ok(bytes)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.call(json!({"opt": "del", "key": key})).await? {
            Some(data) => expect_ok(data),
            None => Err(InvokeError::NotFound(key.to_owned())),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.call(json!({"opt": "exist", "key": key})).await? {
            Some(Value::Bool(found)) => Ok(found),
            Some(other) => Err(InvokeError::Protocol(format!(
                "storage exist for {key:?} returned {other}"
            ))),
            None => Err(InvokeError::Protocol(format!(
                "storage exist for {key:?} got no answer"
            ))),
        }
    }
}

fn expect_ok(data: Value) -> Result<()> {
    match data {
        Value::String(s) if s == STATUS_OK => Ok(()),
        Value::String(s) => Err(InvokeError::Application(s)),
        other => Err(InvokeError::Application(other.to_string())),
    }
}
