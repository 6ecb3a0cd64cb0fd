use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use soma_flow::config::ClientConfig;
use soma_flow::domain::remote_object::{ObjectHandle, ObjectServer, Proxy, RemoteCall, RemoteObject};
use soma_flow::{Error, ErrorKind, Result};

#[derive(Serialize, Deserialize, Debug, Clone)]
enum CounterCall {
    Echo(String),
    Increment,
    Fail,
    Sleep { millis: u64 },
}

impl RemoteCall for CounterCall {
    fn method_name(&self) -> &'static str {
        match self {
            CounterCall::Echo(_) => "echo",
            CounterCall::Increment => "increment",
            CounterCall::Fail => "fail",
            CounterCall::Sleep { .. } => "sleep",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
enum CounterReply {
    Text(String),
    Value(usize),
    Slept,
}

#[derive(Default)]
struct Counter {
    value: AtomicUsize,
}

#[async_trait]
impl RemoteObject for Counter {
    const TYPE_NAME: &'static str = "Counter";

    type Call = CounterCall;
    type Reply = CounterReply;

    async fn handle(&self, call: CounterCall) -> Result<CounterReply> {
        match call {
            CounterCall::Echo(text) => Ok(CounterReply::Text(text)),
            CounterCall::Increment => Ok(CounterReply::Value(self.value.fetch_add(1, Ordering::SeqCst) + 1)),
            CounterCall::Fail => Err(Error::TransferCorrupted { path: "a.img".into() }),
            CounterCall::Sleep { millis } => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(CounterReply::Slept)
            }
        }
    }
}

fn config() -> ClientConfig {
    ClientConfig { poll_tick_ms: 20, ..ClientConfig::default() }
}

async fn serve_counter() -> (ObjectHandle, Arc<Counter>) {
    let server = ObjectServer::bind(None, 1024 * 1024).await.unwrap();
    let counter = Arc::new(Counter::default());
    let handle = server.register(Arc::clone(&counter)).await;
    server.spawn();
    (handle, counter)
}

#[tokio::test]
async fn test_call_returns_reply() {
    let (handle, counter) = serve_counter().await;
    let proxy = Proxy::<Counter>::new(handle, &config()).unwrap();

    assert_eq!(proxy.call(CounterCall::Echo("hi".into())).await.unwrap(), CounterReply::Text("hi".into()));
    assert_eq!(proxy.call(CounterCall::Increment).await.unwrap(), CounterReply::Value(1));
    assert_eq!(proxy.call(CounterCall::Increment).await.unwrap(), CounterReply::Value(2));
    assert_eq!(counter.value.load(Ordering::SeqCst), 2);
    assert_eq!(proxy.requests_sent(), 3);
    assert_eq!(proxy.in_flight(), 0);
}

#[tokio::test]
async fn test_handle_string_round_trips() {
    let (handle, _) = serve_counter().await;
    let proxy = Proxy::<Counter>::from_handle_str(&handle.to_string(), &config()).unwrap();

    assert_eq!(proxy.handle(), &handle);
    assert_eq!(proxy.call(CounterCall::Echo("x".into())).await.unwrap(), CounterReply::Text("x".into()));
}

#[tokio::test]
async fn test_handle_of_other_type_is_refused() {
    let (handle, _) = serve_counter().await;
    let other = ObjectHandle { type_name: "WorkflowEngine".into(), ..handle };

    let err = Proxy::<Counter>::new(other, &config()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_remote_error_keeps_its_kind_and_trace() {
    let (handle, _) = serve_counter().await;
    let proxy = Proxy::<Counter>::new(handle, &config()).unwrap();

    let err = proxy.call(CounterCall::Fail).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    match err {
        Error::RemoteFault(fault) => {
            assert!(fault.message.contains("a.img"));
            assert_eq!(fault.trace.len(), 1);
            assert!(fault.trace[0].starts_with("Counter:"));
            assert!(fault.trace[0].contains(".fail: "));
        }
        other => panic!("expected a remote fault, got {other:?}"),
    }

    // A fault is a normal reply: the channel stays usable.
    assert_eq!(proxy.call(CounterCall::Increment).await.unwrap(), CounterReply::Value(1));
    assert!(!proxy.is_invalidated());
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let (handle, _) = serve_counter().await;
    let missing = ObjectHandle { instance_id: "nope".into(), ..handle };
    let proxy = Proxy::<Counter>::new(missing, &config()).unwrap();

    for _ in 0..2 {
        let err = proxy.call(CounterCall::Increment).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

#[tokio::test]
async fn test_timeout_invalidates_until_reconnect() {
    let (handle, _) = serve_counter().await;
    let proxy = Proxy::<Counter>::new(handle, &config()).unwrap();
    proxy.interrupt_after(Some(Duration::from_millis(100)));

    let err = proxy.call(CounterCall::Sleep { millis: 1000 }).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(proxy.is_invalidated());

    let err = proxy.call(CounterCall::Echo("again".into())).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelInvalidated);

    proxy.reconnect().await;
    proxy.interrupt_after(None);
    assert_eq!(proxy.call(CounterCall::Echo("again".into())).await.unwrap(), CounterReply::Text("again".into()));
}

#[tokio::test]
async fn test_stop_token_cancels_a_call() {
    let (handle, _) = serve_counter().await;
    let proxy = Proxy::<Counter>::new(handle, &config()).unwrap();

    let method = proxy.method(CounterCall::Sleep { millis: 2000 });
    let stop = method.stop_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
    });

    let err = method.invoke().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(proxy.is_invalidated());
    assert_eq!(proxy.in_flight(), 0);
}

#[tokio::test]
async fn test_dropping_proxy_interrupts_calls_in_flight() {
    let (handle, _) = serve_counter().await;
    let proxy = Proxy::<Counter>::new(handle, &config()).unwrap();

    let method = proxy.method(CounterCall::Sleep { millis: 5000 });
    let call = tokio::spawn(method.invoke());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(proxy.in_flight(), 1);

    drop(proxy);
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_unreachable_server_shows_up_as_timeout() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let handle = ObjectHandle { type_name: "Counter".into(), instance_id: "gone".into(), port };
    let proxy = Proxy::<Counter>::new(handle, &config()).unwrap();
    proxy.interrupt_after(Some(Duration::from_millis(200)));

    let err = proxy.call(CounterCall::Increment).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_separate_proxies_call_in_parallel() {
    let (handle, counter) = serve_counter().await;
    let slow = Proxy::<Counter>::new(handle.clone(), &config()).unwrap();
    let fast = Proxy::<Counter>::new(handle, &config()).unwrap();

    let sleeping = tokio::spawn(async move { slow.call(CounterCall::Sleep { millis: 500 }).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fast.call(CounterCall::Increment).await.unwrap(), CounterReply::Value(1));
    assert!(!sleeping.is_finished());
    assert_eq!(sleeping.await.unwrap().unwrap(), CounterReply::Slept);
    assert_eq!(counter.value.load(Ordering::SeqCst), 1);
}
