use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::domain::remote_object::protocol::{self, Fault, ObjectHandle, Request, Response};
use crate::domain::remote_object::transport::{ReplyChannel, ReplyEndpoint};
use crate::error::{Error, ErrorKind, Result};

/// The closed set of operations a registrable type accepts.
///
/// Each variant is one named operation with its typed argument record.
pub trait RemoteCall: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    fn method_name(&self) -> &'static str;
}

/// A server-side object that can be reached through a [`Proxy`](super::proxy::Proxy).
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    type Call: RemoteCall;
    type Reply: Serialize + DeserializeOwned + Debug + Send + 'static;

    async fn handle(&self, call: Self::Call) -> Result<Self::Reply>;
}

/// Object-safe view of a registered object, working on encoded records.
#[async_trait]
trait Dispatch: Send + Sync {
    async fn dispatch(&self, method: &str, args: &[u8]) -> Result<Vec<u8>>;
}

struct Registered<O: RemoteObject>(Arc<O>);

#[async_trait]
impl<O: RemoteObject> Dispatch for Registered<O> {
    async fn dispatch(&self, method: &str, args: &[u8]) -> Result<Vec<u8>> {
        let call: O::Call = protocol::decode(args)?;
        if call.method_name() != method {
            return Err(Error::ProtocolError(format!("request names method '{}' but carries '{}'", method, call.method_name())));
        }
        let reply = self.0.handle(call).await?;
        Ok(bincode::serialize(&reply)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    type_name: String,
    instance_id: String,
}

/// Thread-safe map `(type_name, instance_id) -> live object`.
#[derive(Clone, Default)]
pub struct ObjectRegistry {
    objects: Arc<RwLock<HashMap<ObjectKey, Arc<dyn Dispatch>>>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert<O: RemoteObject>(&self, object: Arc<O>) -> String {
        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        let key = ObjectKey { type_name: O::TYPE_NAME.to_string(), instance_id: instance_id.clone() };

        let mut map = self.objects.write().await;
        map.insert(key, Arc::new(Registered(object)));

        instance_id
    }

    async fn lookup(&self, type_name: &str, instance_id: &str) -> Option<Arc<dyn Dispatch>> {
        let key = ObjectKey { type_name: type_name.to_string(), instance_id: instance_id.to_string() };
        self.objects.read().await.get(&key).cloned()
    }
}

/// Holds live objects and serves calls to them on one reply endpoint.
///
/// Calls arriving on one channel are handled strictly one after the other.
/// Separate channels are served by separate tasks and may run concurrently.
pub struct ObjectServer {
    endpoint: ReplyEndpoint,
    registry: ObjectRegistry,
}

impl ObjectServer {
    pub async fn bind(port: Option<u16>, max_frame_length: usize) -> Result<Self> {
        let endpoint = ReplyEndpoint::bind(port, max_frame_length).await?;
        log::info!("Object server listening on port {}", endpoint.port());
        Ok(Self { endpoint, registry: ObjectRegistry::new() })
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    /// Registers `object` and returns the handle a proxy needs to reach it.
    pub async fn register<O: RemoteObject>(&self, object: Arc<O>) -> ObjectHandle {
        let instance_id = self.registry.insert(object).await;
        let handle = ObjectHandle { type_name: O::TYPE_NAME.to_string(), instance_id, port: self.port() };
        log::debug!("Registered {} object as {}", O::TYPE_NAME, handle);
        handle
    }

    /// Accepts channels until the endpoint itself fails. A failure on a single
    /// channel only ends that channel; a failure to accept is returned and is
    /// fatal to the server.
    pub async fn serve_forever(self) -> Result<()> {
        let port = self.port();
        loop {
            let channel = match self.endpoint.accept().await {
                Ok(channel) => channel,
                Err(e) => {
                    log::error!("Object server on port {} stopped accepting channels: {}", port, e);
                    return Err(Error::IoError(e));
                }
            };
            log::debug!("Object server on port {} accepted channel from {}", port, channel.peer());
            tokio::spawn(serve_channel(channel, self.registry.clone(), port));
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.serve_forever())
    }
}

async fn serve_channel(mut channel: ReplyChannel, registry: ObjectRegistry, port: u16) {
    let peer = channel.peer();
    loop {
        let frame = match channel.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("Channel from {} closed", peer);
                return;
            }
            Err(e) => {
                log::error!("Receive failed on channel from {}: {}", peer, e);
                return;
            }
        };

        let response = handle_frame(&registry, &frame, port).await;

        let payload = match protocol::encode(&response) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Cannot encode response for {}: {}", peer, e);
                match protocol::encode(&Response::Fault(e.into_fault(&format!("object server :{port}")))) {
                    Ok(payload) => payload,
                    Err(_) => return,
                }
            }
        };

        if let Err(e) = channel.reply(payload).await {
            log::error!("Reply failed on channel from {}: {}", peer, e);
            return;
        }
    }
}

async fn handle_frame(registry: &ObjectRegistry, frame: &[u8], port: u16) -> Response {
    let request: Request = match protocol::decode(frame) {
        Ok(request) => request,
        Err(e) => {
            log::error!("Undecodable request on port {}: {}", port, e);
            return Response::Fault(e.into_fault(&format!("object server :{port}")));
        }
    };
    let hop = format!("{}:{}:{}.{}", request.type_name, request.instance_id, port, request.method);

    let Some(target) = registry.lookup(&request.type_name, &request.instance_id).await else {
        log::warn!("No object registered as {}:{} (method {})", request.type_name, request.instance_id, request.method);
        let mut fault = Fault::new(ErrorKind::NotFound, format!("object {}:{} not found", request.type_name, request.instance_id));
        fault.append_trace(format!("{hop}: no such object"));
        return Response::Fault(fault);
    };

    log::debug!("Calling {} ({} argument bytes)", hop, request.args.len());

    match target.dispatch(&request.method, &request.args).await {
        Ok(value) => Response::Value(value),
        Err(e) => {
            if let Error::RemoteFault(upstream) = &e {
                log::error!("{} failed with an upstream fault:\n{}", hop, upstream.formatted_trace());
            } else {
                log::error!("{} failed: {}", hop, e);
            }
            Response::Fault(e.into_fault(&hop))
        }
    }
}
