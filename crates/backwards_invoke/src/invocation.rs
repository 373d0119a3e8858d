//! Typed wrapper over [`Session::send`] and [`HttpInvoker::send`].
//!
//! [`BackwardsInvocation::invoke`] returns an [`InvocationStream`] that
//! decodes each raw frame into `T` only when the caller asks for the next
//! element. Dropping the stream before it ends cancels the request.

use std::marker::PhantomData;

use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{InvokeError, Result};
use crate::kind::InvokeType;
use crate::serverless::{HttpInvoker, HttpReplies};
use crate::session::{Session, Subscription};

/// Where backwards requests go.
#[derive(Debug, Clone)]
enum Backend {
    Session(Session),
    Http(HttpInvoker),
}

/// Issues backwards requests on behalf of one plugin session id.
#[derive(Debug, Clone)]
pub struct BackwardsInvocation {
    backend: Backend,
    session_id: Option<String>,
}

impl BackwardsInvocation {
    pub fn new(session: Session, session_id: Option<String>) -> Self {
        Self {
            backend: Backend::Session(session),
            session_id,
        }
    }

    /// Requests travel as HTTP transactions instead of over a duplex session.
    pub fn serverless(invoker: HttpInvoker, session_id: Option<String>) -> Self {
        Self {
            backend: Backend::Http(invoker),
            session_id,
        }
    }

    /// The duplex session, `None` for serverless invocations.
    pub fn session(&self) -> Option<&Session> {
        match &self.backend {
            Backend::Session(session) => Some(session),
            Backend::Http(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Send `payload` as a `kind` request and stream the typed replies.
    pub fn invoke<T: DeserializeOwned>(
        &self,
        kind: InvokeType,
        payload: Value,
    ) -> Result<InvocationStream<T>> {
        let sid = self.session_id.as_deref();
        let replies = match &self.backend {
            Backend::Session(session) => Replies::Session(session.send(sid, kind, payload)?),
            Backend::Http(invoker) => Replies::Http(invoker.send(sid, kind, payload)?),
        };
        Ok(InvocationStream::new(replies))
    }

    /// First element of the reply stream, `None` when the daemon sent none.
    ///
    /// The rest of the stream is abandoned once the first element arrives.
    pub async fn invoke_single<T: DeserializeOwned>(
        &self,
        kind: InvokeType,
        payload: Value,
    ) -> Result<Option<T>> {
        let mut stream = self.invoke::<T>(kind, payload)?;
        stream.next().await.transpose()
    }
}

/// Raw reply frames of one request, from either backend.
#[derive(Debug)]
enum Replies {
    Session(Subscription),
    Http(HttpReplies),
}

impl Replies {
    fn request_id(&self) -> &str {
        match self {
            Replies::Session(sub) => sub.request_id(),
            Replies::Http(http) => http.request_id(),
        }
    }

    async fn recv(&mut self) -> Result<Option<Value>> {
        match self {
            Replies::Session(sub) => sub.recv().await,
            Replies::Http(http) => http.recv().await,
        }
    }
}

/// Lazy, pull-based sequence of `T` for one backwards request.
#[derive(Debug)]
pub struct InvocationStream<T> {
    sub: Replies,
    finished: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> InvocationStream<T> {
    fn new(sub: Replies) -> Self {
        Self {
            sub,
            finished: false,
            _marker: PhantomData,
        }
    }

    pub fn request_id(&self) -> &str {
        self.sub.request_id()
    }

    /// Next decoded element. `None` after the terminal frame or after an
    /// error has been returned.
    pub async fn next(&mut self) -> Option<Result<T>> {
        if self.finished {
            return None;
        }
        let item = match self.sub.recv().await {
            Ok(Some(raw)) => serde_json::from_value::<T>(raw).map_err(|source| InvokeError::Decode {
                request_id: self.sub.request_id().to_owned(),
                source,
            }),
            Ok(None) => {
                self.finished = true;
                return None;
            }
            Err(e) => Err(e),
        };
        if item.is_err() {
            self.finished = true;
        }
        Some(item)
    }

    /// Drain the remaining elements.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut s| async move {
            let item = s.next().await?;
            Some((item, s))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_daemon::MockDaemon;
    use futures::StreamExt;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Chunk {
        text: String,
    }

    #[tokio::test]
    async fn decodes_lazily_and_stops_on_bad_frame() {
        let (mock, _inbound) = MockDaemon::start();
        let inv = BackwardsInvocation::new(mock.session(), Some("s1".into()));

        let mut stream = inv.invoke::<Chunk>(InvokeType::Llm, json!({})).unwrap();
        let req = mock.next_request().await.unwrap();
        mock.reply(&req.backwards_request_id, json!({"text": "a"})).await;
        mock.reply(&req.backwards_request_id, json!({"nope": 1})).await;
        mock.reply(&req.backwards_request_id, json!({"text": "never"})).await;
        mock.end(&req.backwards_request_id).await;

        assert_eq!(stream.next().await.unwrap().unwrap(), Chunk { text: "a".into() });
        assert!(matches!(stream.next().await, Some(Err(InvokeError::Decode { .. }))));
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(mock.session().outstanding(), 0);
    }

    #[tokio::test]
    async fn single_returns_none_on_empty_reply() {
        let (mock, _inbound) = MockDaemon::start();
        let inv = BackwardsInvocation::new(mock.session(), None);

        let responder = {
            let mock = mock.clone();
            tokio::spawn(async move {
                let req = mock.next_request().await.unwrap();
                mock.end(&req.backwards_request_id).await;
            })
        };
        let got: Option<Chunk> = inv.invoke_single(InvokeType::Tool, json!({})).await.unwrap();
        assert!(got.is_none());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn serverless_invocation_decodes_http_replies() {
        use crate::frame::{BackwardsResponse, InboundFrame};
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let daemon = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // the request body is one frame line
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            while !raw.ends_with(b"}\n") {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0, "request cut short");
                raw.extend_from_slice(&buf[..n]);
            }
            let mut reply = String::from("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
            for rsp in [
                BackwardsResponse::response("r", json!({"text": "hi"})),
                BackwardsResponse::end("r"),
            ] {
                reply.push_str(&InboundFrame::backwards_response(None, &rsp).unwrap().to_line().unwrap());
            }
            sock.write_all(reply.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
        });

        let invoker = HttpInvoker::new(&url, Duration::from_secs(5)).unwrap();
        let inv = BackwardsInvocation::serverless(invoker, Some("s".into()));
        assert!(inv.session().is_none());
        let got = inv.invoke::<Chunk>(InvokeType::Llm, json!({})).unwrap().collect_all().await.unwrap();
        assert_eq!(got, vec![Chunk { text: "hi".into() }]);
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn works_as_futures_stream() {
        let (mock, _inbound) = MockDaemon::start();
        let inv = BackwardsInvocation::new(mock.session(), None);
        let stream = inv.invoke::<u32>(InvokeType::Tool, json!({})).unwrap();
        let req = mock.next_request().await.unwrap();
        for i in 1..=3 {
            mock.reply(&req.backwards_request_id, json!(i)).await;
        }
        mock.end(&req.backwards_request_id).await;

        let got: Vec<u32> = stream.into_stream().map(|r| r.unwrap()).collect().await;
        assert_eq!(got, vec![1, 2, 3]);
    }
}
