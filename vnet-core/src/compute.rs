//! The [`ComputeHandle`] trait and supporting types.
//!
//! A compute handle is the controller's only way of reaching a compute host.
//! Everything it learns about nodes on that host comes back as RPC responses;
//! no memory is shared between the two.

use crate::Id;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Display;

mod channel;
pub use channel::ChannelCompute;
pub(crate) use channel::{Envelope, ENVELOPE_QUEUE};

mod subnet;
pub use subnet::ip_on_same_subnet;

/// The id of the compute host that runs alongside the controller.
pub const LOCAL_COMPUTE_ID: &str = "local";

/// A stream of raw file contents.
pub type ByteStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        })
    }
}

/// An RPC addressed to a compute host.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub json: Value,
}

impl Response {
    pub fn ok(json: Value) -> Self {
        Self { status: 200, json }
    }

    pub fn created(json: Value) -> Self {
        Self { status: 201, json }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            json: Value::Null,
        }
    }

    pub fn error(status: u16, message: impl Display) -> Self {
        Self {
            status,
            json: json!({ "status": status, "message": message.to_string() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into a [`RemoteError::Status`].
    pub fn into_result(self, compute: &str) -> Result<Self, RemoteError> {
        if self.is_success() {
            return Ok(self);
        }
        let message = self
            .json
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message")
            .to_string();
        Err(RemoteError::Status {
            compute: compute.to_string(),
            status: self.status,
            message,
        })
    }

    /// Decodes the body into `T`.
    pub fn decode<T: DeserializeOwned>(&self, compute: &str) -> Result<T, RemoteError> {
        serde_json::from_value(self.json.clone()).map_err(|e| RemoteError::Decode {
            compute: compute.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A network interface of a compute host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub ip_address: String,
    pub netmask: Option<String>,
}

/// Any failure to get a successful answer from a compute host.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Compute {compute} answered {status}: {message}")]
    Status {
        compute: String,
        status: u16,
        message: String,
    },
    #[error("Compute {0} did not answer in time")]
    Timeout(String),
    #[error("Compute {0} is unreachable")]
    Unreachable(String),
    #[error("Unexpected answer from compute {compute}: {reason}")]
    Decode { compute: String, reason: String },
    #[error("No common subnet for compute {0} and {1}")]
    NoCommonSubnet(String, String),
}

/// A client for one compute host.
#[async_trait]
pub trait ComputeHandle: Send + Sync {
    /// The stable id of the compute host.
    fn id(&self) -> &str;

    /// The address the compute host advertises.
    fn host(&self) -> &str;

    /// Whether this compute host runs alongside the controller.
    fn is_local(&self) -> bool {
        self.id() == LOCAL_COMPUTE_ID
    }

    /// Sends one RPC. Non-2xx answers are errors.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, RemoteError>;

    /// Streams a file from the project directory on the compute host.
    async fn stream_file(&self, project_id: Id, path: &str) -> Result<ByteStream, RemoteError>;

    async fn get(&self, path: &str) -> Result<Response, RemoteError> {
        self.request(Method::Get, path, None).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Response, RemoteError> {
        self.request(Method::Post, path, body).await
    }

    async fn put(&self, path: &str, body: Option<Value>) -> Result<Response, RemoteError> {
        self.request(Method::Put, path, body).await
    }

    async fn delete(&self, path: &str) -> Result<Response, RemoteError> {
        self.request(Method::Delete, path, None).await
    }

    async fn interfaces(&self) -> Result<Vec<Interface>, RemoteError> {
        self.get("/network/interfaces").await?.decode(self.id())
    }

    /// Picks an address on this host and one on `other` that can reach each
    /// other, returned as `(this host's address, other host's address)`.
    async fn get_ip_on_same_subnet(
        &self,
        other: &dyn ComputeHandle,
    ) -> Result<(String, String), RemoteError> {
        ip_on_same_subnet(self, other).await
    }
}
