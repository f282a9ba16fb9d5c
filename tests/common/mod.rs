//! A scripted transport standing in for the wire.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use filament::{
    CloseCause, Connection, ErrorKind, Origin, RejectReason, RequestHead, ResponseHead, Result,
    StreamTransport, TlsTrust, Transport,
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::watch;

/// What the next mock stream should do.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Become ready and answer with this status, headers and body.
    Respond {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    },
    /// Reject the stream at readiness time.
    Reject(RejectReason),
    /// Become ready but never produce a response.
    Stall,
    /// Answer with this status, then fail the body read.
    BodyReject { status: u16, reason: RejectReason },
}

impl StreamScript {
    pub fn ok() -> Self {
        Self::Respond {
            status: 200,
            headers: Vec::new(),
            body: "",
        }
    }
}

/// A transport whose connections hand out scripted streams.
///
/// Scripts queue globally across connections, so a retry against a fresh
/// session pops the next script. With no scripts queued, streams follow
/// the default script.
#[derive(Debug)]
pub struct MockTransport {
    scripts: Arc<Mutex<VecDeque<StreamScript>>>,
    default_script: Mutex<StreamScript>,
    connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    fail_connects: AtomicUsize,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    last_head: Arc<Mutex<Option<RequestHead>>>,
    last_body: Arc<Mutex<Option<Bytes>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            default_script: Mutex::new(StreamScript::ok()),
            connects: AtomicUsize::new(0),
            connect_delay: Mutex::new(None),
            fail_connects: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            last_head: Arc::new(Mutex::new(None)),
            last_body: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue a script for the next opened stream.
    pub fn script(&self, script: StreamScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Change what unscripted streams do.
    pub fn set_default(&self, script: StreamScript) {
        *self.default_script.lock().unwrap() = script;
    }

    /// Delay every connect, widening the race window for concurrent
    /// callers.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Make the next connect attempt fail.
    pub fn fail_next_connect(&self) {
        self.fail_connects.fetch_add(1, Ordering::SeqCst);
    }

    /// How many connections have been established.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// All connections established so far.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }

    /// The header block of the most recently opened stream.
    pub fn last_head(&self) -> Option<RequestHead> {
        self.last_head.lock().unwrap().clone()
    }

    /// The body of the most recently sent request.
    pub fn last_body(&self) -> Option<Bytes> {
        self.last_body.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        origin: &Origin,
        _trust: Option<&TlsTrust>,
    ) -> Result<Arc<dyn Connection>> {
        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(ErrorKind::Connect {
                origin: origin.clone(),
                reason: "connection refused".into(),
            });
        }

        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.connects.fetch_add(1, Ordering::SeqCst);

        let (close_tx, _) = watch::channel(None);
        let connection = Arc::new(MockConnection {
            scripts: Arc::clone(&self.scripts),
            default_script: self.default_script.lock().unwrap().clone(),
            close_tx,
            last_head: Arc::clone(&self.last_head),
            last_body: Arc::clone(&self.last_body),
        });
        self.connections.lock().unwrap().push(Arc::clone(&connection));

        Ok(connection)
    }
}

#[derive(Debug)]
pub struct MockConnection {
    scripts: Arc<Mutex<VecDeque<StreamScript>>>,
    default_script: StreamScript,
    close_tx: watch::Sender<Option<CloseCause>>,
    last_head: Arc<Mutex<Option<RequestHead>>>,
    last_body: Arc<Mutex<Option<Bytes>>>,
}

impl MockConnection {
    /// Simulate the transport reporting termination.
    pub fn trigger_close(&self, cause: CloseCause) {
        self.close_tx.send_replace(Some(cause));
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_stream(
        &self,
        head: RequestHead,
    ) -> std::result::Result<Box<dyn StreamTransport>, RejectReason> {
        *self.last_head.lock().unwrap() = Some(head);

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_script.clone());

        Ok(Box::new(MockStream {
            script,
            last_body: Arc::clone(&self.last_body),
        }))
    }

    async fn closed(&self) -> CloseCause {
        let mut rx = self.close_tx.subscribe();
        let cause = match rx.wait_for(|cause| cause.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        cause.unwrap_or(CloseCause::Closed)
    }

    fn close(&self) {
        self.close_tx.send_replace(Some(CloseCause::Closed));
    }
}

#[derive(Debug)]
struct MockStream {
    script: StreamScript,
    last_body: Arc<Mutex<Option<Bytes>>>,
}

#[async_trait]
impl StreamTransport for MockStream {
    fn id(&self) -> Option<u64> {
        // exercise the explicit readiness negotiation
        None
    }

    async fn ready(&mut self) -> std::result::Result<(), RejectReason> {
        match &self.script {
            StreamScript::Reject(reason) => Err(reason.clone()),
            _ => Ok(()),
        }
    }

    async fn send_body(&mut self, body: Bytes) -> std::result::Result<(), RejectReason> {
        *self.last_body.lock().unwrap() = Some(body);
        Ok(())
    }

    async fn response(&mut self) -> std::result::Result<ResponseHead, RejectReason> {
        match &self.script {
            StreamScript::Respond {
                status, headers, ..
            } => Ok(response_head(*status, headers)),
            StreamScript::BodyReject { status, .. } => Ok(response_head(*status, &[])),
            StreamScript::Stall => std::future::pending().await,
            StreamScript::Reject(reason) => Err(reason.clone()),
        }
    }

    async fn body(&mut self) -> std::result::Result<Bytes, RejectReason> {
        match &self.script {
            StreamScript::Respond { body, .. } => Ok(Bytes::from_static(body.as_bytes())),
            StreamScript::BodyReject { reason, .. } => Err(reason.clone()),
            _ => Ok(Bytes::new()),
        }
    }

    fn abort(&mut self) {}
}

fn response_head(status: u16, headers: &[(&'static str, &'static str)]) -> ResponseHead {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    ResponseHead {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
    }
}

/// Let spawned tasks (eviction watchers, close watchers) run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Parse an origin from a URL string.
pub fn origin(url: &str) -> Origin {
    Origin::try_from(&url::Url::parse(url).unwrap()).unwrap()
}
