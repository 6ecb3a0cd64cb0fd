use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::domain::remote_object::object_server::{RemoteCall, RemoteObject};
use crate::domain::remote_object::protocol::{self, ObjectHandle, Request, Response};
use crate::domain::remote_object::transport::RequestChannel;
use crate::error::{Error, Result};

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a proxy and every call it handed out.
struct ProxyShared {
    handle: ObjectHandle,
    poll_tick: Duration,
    channel: tokio::sync::Mutex<Option<RequestChannel>>,
    invalidated: AtomicBool,
    timeout: Mutex<Option<Duration>>,
    in_flight: Mutex<HashMap<u64, CancellationToken>>,
    next_call_id: AtomicU64,
    requests_sent: AtomicU64,
}

/// Client-side stand-in for an object held by an [`ObjectServer`](super::object_server::ObjectServer).
///
/// A proxy owns one channel; calls through it are serialised, so parallel
/// calls need separate proxies. Creating a proxy never touches the network:
/// an unreachable server shows up as the first call timing out.
pub struct Proxy<O: RemoteObject> {
    shared: Arc<ProxyShared>,
    _object: PhantomData<fn() -> O>,
}

impl<O: RemoteObject> Proxy<O> {
    pub fn new(handle: ObjectHandle, config: &ClientConfig) -> Result<Self> {
        if handle.type_name != O::TYPE_NAME {
            return Err(Error::ProtocolError(format!("handle {} does not point to a {} object", handle, O::TYPE_NAME)));
        }
        log::debug!("Proxy for {} created", handle);

        let shared = ProxyShared {
            handle,
            poll_tick: config.poll_tick(),
            channel: tokio::sync::Mutex::new(None),
            invalidated: AtomicBool::new(false),
            timeout: Mutex::new(config.call_timeout()),
            in_flight: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
        };
        Ok(Self { shared: Arc::new(shared), _object: PhantomData })
    }

    pub fn from_handle_str(handle: &str, config: &ClientConfig) -> Result<Self> {
        Self::new(handle.parse()?, config)
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.shared.handle
    }

    /// Binds `call` to this proxy without sending it yet. The returned unit
    /// exposes its stop token before it is invoked.
    pub fn method(&self, call: O::Call) -> RemoteMethod<O> {
        let id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        lock(&self.shared.in_flight).insert(id, stop.clone());

        RemoteMethod { shared: Arc::clone(&self.shared), id, call: Some(call), stop, _object: PhantomData }
    }

    pub async fn call(&self, call: O::Call) -> Result<O::Reply> {
        self.method(call).invoke().await
    }

    /// Sets the per-call timeout for every later tick check; `None` waits forever.
    pub fn interrupt_after(&self, timeout: Option<Duration>) {
        *lock(&self.shared.timeout) = timeout.filter(|t| !t.is_zero());
    }

    /// Flags every outstanding call to stop. Returns how many were flagged.
    pub fn interrupt_all(&self) -> usize {
        let in_flight = lock(&self.shared.in_flight);
        for token in in_flight.values() {
            token.cancel();
        }
        in_flight.len()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.shared.in_flight).len()
    }

    /// `true` once a call was abandoned after its request went out. The channel
    /// then holds an unanswered request and refuses calls until [`reconnect`](Self::reconnect).
    pub fn is_invalidated(&self) -> bool {
        self.shared.invalidated.load(Ordering::SeqCst)
    }

    /// Discards the current channel; the next call establishes a fresh one.
    pub async fn reconnect(&self) {
        let mut channel = self.shared.channel.lock().await;
        *channel = None;
        self.shared.invalidated.store(false, Ordering::SeqCst);
        log::debug!("Proxy for {} will reconnect on next call", self.shared.handle);
    }

    /// Number of requests actually put on the wire by this proxy.
    pub fn requests_sent(&self) -> u64 {
        self.shared.requests_sent.load(Ordering::Relaxed)
    }
}

impl<O: RemoteObject> Drop for Proxy<O> {
    fn drop(&mut self) {
        let interrupted = self.interrupt_all();
        if interrupted > 0 {
            log::debug!("Proxy for {} released with {} call(s) in flight", self.shared.handle, interrupted);
        }
    }
}

/// One call bound to a proxy.
///
/// Invoking it sends the request, then waits for the reply in bounded poll
/// ticks. Between ticks the stop token and the proxy timeout are checked.
/// If the call is abandoned after the request was sent, the server may still
/// complete the work, and the proxy is invalidated.
pub struct RemoteMethod<O: RemoteObject> {
    shared: Arc<ProxyShared>,
    id: u64,
    call: Option<O::Call>,
    stop: CancellationToken,
    _object: PhantomData<fn() -> O>,
}

impl<O: RemoteObject> RemoteMethod<O> {
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn interrupt(&self) {
        self.stop.cancel();
    }

    pub async fn invoke(mut self) -> Result<O::Reply> {
        let call = self.call.take().ok_or_else(|| Error::ProtocolError("remote method invoked twice".into()))?;
        let shared = Arc::clone(&self.shared);
        let method = call.method_name();
        let started = Instant::now();

        let request = Request {
            type_name: shared.handle.type_name.clone(),
            instance_id: shared.handle.instance_id.clone(),
            method: method.to_string(),
            args: bincode::serialize(&call)?,
        };
        let payload = protocol::encode(&request)?;

        let mut guard = loop {
            match time::timeout(shared.poll_tick, shared.channel.lock()).await {
                Ok(guard) => break guard,
                Err(_) => self.check_abort(method, started)?,
            }
        };

        if shared.invalidated.load(Ordering::SeqCst) {
            return Err(Error::ChannelInvalidated(shared.handle.to_string()));
        }
        self.check_abort(method, started)?;

        let mut channel = match guard.take() {
            Some(channel) => channel,
            None => self.establish(method, started).await?,
        };

        shared.requests_sent.fetch_add(1, Ordering::Relaxed);
        log::debug!("-> {}.{} ({} bytes)", shared.handle, method, payload.len());

        if let Err(e) = channel.send(payload).await {
            log::error!("Sending {}.{}({:?}) failed: {}", shared.handle.type_name, method, call, e);
            return Err(self.transport_error(method, e));
        }

        let frame = loop {
            match time::timeout(shared.poll_tick, channel.recv()).await {
                Ok(Ok(frame)) => break frame,
                Ok(Err(e)) => {
                    log::error!("Receiving reply of {}.{}({:?}) failed: {}", shared.handle.type_name, method, call, e);
                    return Err(self.transport_error(method, e));
                }
                Err(_) => {
                    if let Err(abort) = self.check_abort(method, started) {
                        shared.invalidated.store(true, Ordering::SeqCst);
                        log::warn!("Abandoning {}.{}({:?}): {}", shared.handle.type_name, method, call, abort);
                        return Err(abort);
                    }
                }
            }
        };

        *guard = Some(channel);
        drop(guard);

        match protocol::decode::<Response>(&frame)? {
            Response::Value(bytes) => {
                log::debug!("<- {}.{} ({} bytes)", shared.handle, method, bytes.len());
                protocol::decode(&bytes)
            }
            Response::Fault(fault) => {
                log::error!(
                    "{}.{} raised a remote {} fault: {}\nremote trace:\n{}",
                    shared.handle.type_name,
                    method,
                    fault.kind,
                    fault.message,
                    fault.formatted_trace()
                );
                Err(Error::RemoteFault(fault))
            }
        }
    }

    async fn establish(&self, method: &str, started: Instant) -> Result<RequestChannel> {
        let port = self.shared.handle.port;
        loop {
            match time::timeout(self.shared.poll_tick, RequestChannel::connect(port, MAX_FRAME_LENGTH)).await {
                Ok(Ok(channel)) => return Ok(channel),
                Ok(Err(e)) => {
                    log::debug!("No listener reachable on port {} yet: {}", port, e);
                    time::sleep(self.shared.poll_tick).await;
                }
                Err(_) => {}
            }
            self.check_abort(method, started)?;
        }
    }

    fn check_abort(&self, method: &str, started: Instant) -> Result<()> {
        let type_name = &self.shared.handle.type_name;
        if self.stop.is_cancelled() {
            return Err(Error::Cancelled { type_name: type_name.clone(), method: method.to_string() });
        }
        if let Some(timeout) = *lock(&self.shared.timeout) {
            let elapsed = started.elapsed();
            if elapsed > timeout {
                return Err(Error::Timeout { type_name: type_name.clone(), method: method.to_string(), elapsed });
            }
        }
        Ok(())
    }

    fn transport_error(&self, method: &str, e: std::io::Error) -> Error {
        Error::TransportError { type_name: self.shared.handle.type_name.clone(), method: method.to_string(), message: e.to_string() }
    }
}

impl<O: RemoteObject> Drop for RemoteMethod<O> {
    fn drop(&mut self) {
        lock(&self.shared.in_flight).remove(&self.id);
    }
}
