use super::{ByteStream, ComputeHandle, Method, RemoteError, Request, Response};
use crate::Id;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::{io, time::Duration};
use tokio::sync::{mpsc, oneshot};

/// The size of the queue between a [`ChannelCompute`] and its host.
pub(crate) const ENVELOPE_QUEUE: usize = 64;

/// What travels from a [`ChannelCompute`] to the host serving it.
pub(crate) enum Envelope {
    Request {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    StreamFile {
        project_id: Id,
        path: String,
        reply: oneshot::Sender<Result<mpsc::Receiver<io::Result<Vec<u8>>>, Response>>,
    },
}

/// A [`ComputeHandle`] that reaches a compute host served in the same process
/// through a message channel.
#[derive(Debug, Clone)]
pub struct ChannelCompute {
    id: String,
    host: String,
    timeout: Duration,
    sender: mpsc::Sender<Envelope>,
}

impl ChannelCompute {
    pub(crate) fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        timeout: Duration,
        sender: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            timeout,
            sender,
        }
    }

    async fn exchange<T>(
        &self,
        envelope: Envelope,
        receive: oneshot::Receiver<T>,
    ) -> Result<T, RemoteError> {
        self.sender
            .send(envelope)
            .await
            .map_err(|_| RemoteError::Unreachable(self.id.clone()))?;
        match tokio::time::timeout(self.timeout, receive).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(RemoteError::Unreachable(self.id.clone())),
            Err(_) => Err(RemoteError::Timeout(self.id.clone())),
        }
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Envelope::Request { request, .. } => write!(f, "Request({} {})", request.method, request.path),
            Envelope::StreamFile { path, .. } => write!(f, "StreamFile({})", path),
        }
    }
}

#[async_trait]
impl ComputeHandle for ChannelCompute {
    fn id(&self) -> &str {
        &self.id
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, RemoteError> {
        tracing::debug!(compute = %self.id, %method, path, "Sending compute request");
        let (reply, receive) = oneshot::channel();
        let request = Request {
            method,
            path: path.to_string(),
            body,
        };
        self.exchange(Envelope::Request { request, reply }, receive)
            .await?
            .into_result(&self.id)
    }

    async fn stream_file(&self, project_id: Id, path: &str) -> Result<ByteStream, RemoteError> {
        let (reply, receive) = oneshot::channel();
        let envelope = Envelope::StreamFile {
            project_id,
            path: path.to_string(),
            reply,
        };
        match self.exchange(envelope, receive).await? {
            Ok(chunks) => Ok(futures::stream::unfold(chunks, |mut chunks| async move {
                chunks.recv().await.map(|chunk| (chunk, chunks))
            })
            .boxed()),
            Err(response) => Err(response
                .into_result(&self.id)
                .err()
                .unwrap_or_else(|| RemoteError::Unreachable(self.id.clone()))),
        }
    }
}
