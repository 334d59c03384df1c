#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use vnet::node::Node;
use vnet_core::{
    compute::{ByteStream, Method, RemoteError, Request, Response},
    node::NodeType,
    port::{PortAddress, PortInfo},
    ComputeHandle, Id,
};

/// A compute handle that answers from a script and records every request.
#[derive(Default)]
pub struct RecordingCompute {
    id: String,
    host: String,
    subnet: Option<(String, String)>,
    udp_ports: Mutex<VecDeque<u16>>,
    failing: Mutex<Option<(Method, String, bool)>>,
    requests: Mutex<Vec<Request>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    streamed: Mutex<Vec<(Id, String)>>,
}

impl RecordingCompute {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.into(),
            host: format!("{}.example", id),
            ..Default::default()
        }
    }

    /// Answers address selection with this pair.
    pub fn with_subnet(mut self, this: &str, other: &str) -> Self {
        self.subnet = Some((this.into(), other.into()));
        self
    }

    /// Hands out these ports to UDP allocations, in order.
    pub fn with_udp_ports(self, ports: &[u16]) -> Self {
        self.udp_ports.lock().unwrap().extend(ports);
        self
    }

    /// Fails requests with `method` whose path ends with `suffix`.
    pub fn fail(&self, method: Method, suffix: &str) {
        *self.failing.lock().unwrap() = Some((method, suffix.into(), false));
    }

    /// Like [`RecordingCompute::fail`], but the request times out instead of
    /// being refused.
    pub fn time_out(&self, method: Method, suffix: &str) {
        *self.failing.lock().unwrap() = Some((method, suffix.into(), true));
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        self.files.lock().unwrap().insert(path.into(), contents.to_vec());
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn streamed(&self) -> Vec<(Id, String)> {
        self.streamed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeHandle for RecordingCompute {
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
        self.requests.lock().unwrap().push(Request {
            method,
            path: path.into(),
            body: body.clone(),
        });
        if let Some((failing, suffix, timeout)) = &*self.failing.lock().unwrap() {
            if *failing == method && path.ends_with(suffix.as_str()) {
                if *timeout {
                    return Err(RemoteError::Timeout(self.id.clone()));
                }
                return Err(RemoteError::Status {
                    compute: self.id.clone(),
                    status: 409,
                    message: "scripted failure".into(),
                });
            }
        }
        if path.ends_with("/ports/udp") {
            let port = self.udp_ports.lock().unwrap().pop_front().unwrap_or(4242);
            return Ok(Response::created(json!({ "udp_port": port })));
        }
        Ok(Response::ok(body.unwrap_or(Value::Null)))
    }

    async fn stream_file(&self, project_id: Id, path: &str) -> Result<ByteStream, RemoteError> {
        self.streamed.lock().unwrap().push((project_id, path.into()));
        let contents = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::Status {
                compute: self.id.clone(),
                status: 404,
                message: format!("{} not found", path),
            })?;
        Ok(futures::stream::iter(vec![Ok(contents)]).boxed())
    }

    async fn get_ip_on_same_subnet(
        &self,
        other: &dyn ComputeHandle,
    ) -> Result<(String, String), RemoteError> {
        match &self.subnet {
            Some(pair) => Ok(pair.clone()),
            None => vnet_core::compute::ip_on_same_subnet(self, other).await,
        }
    }
}

/// A node with the given ports on `compute`.
pub fn node(
    project: Id,
    compute: &Arc<RecordingCompute>,
    name: &str,
    node_type: NodeType,
    ports: &[(u32, u32)],
) -> Node {
    let ports = ports
        .iter()
        .map(|&(adapter, port)| {
            PortInfo::new(PortAddress::new(adapter, port), format!("e{}/{}", adapter, port))
        })
        .collect();
    Node::new(
        Id::random(),
        project,
        name,
        node_type,
        compute.clone() as Arc<dyn ComputeHandle>,
        ports,
    )
}
