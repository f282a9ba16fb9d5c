use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use h2::client::{self, ResponseFuture, SendRequest};
use h2::{Reason, RecvStream, SendStream};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::types::{ErrorKind, Origin, Result};

use super::{
    CloseCause, Connection, RejectReason, RequestHead, ResponseHead, StreamTransport, TlsTrust,
    Transport,
};

/// Transport backed by the `h2` crate: TCP for `http` origins, rustls
/// with `h2` ALPN for `https` origins.
#[derive(Debug, Clone, Copy, Default)]
pub struct H2Transport;

#[async_trait]
impl Transport for H2Transport {
    async fn connect(
        &self,
        origin: &Origin,
        trust: Option<&TlsTrust>,
    ) -> Result<Arc<dyn Connection>> {
        let connect_error = |reason: String| ErrorKind::Connect {
            origin: origin.clone(),
            reason,
        };

        let tcp = TcpStream::connect((origin.host(), origin.port()))
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        let _ = tcp.set_nodelay(true);

        if origin.is_https() {
            let trust = trust.ok_or_else(|| {
                connect_error("no trust roots configured for a https origin".into())
            })?;
            let connector = tls_connector(trust).map_err(connect_error)?;
            let name = ServerName::try_from(origin.host().to_owned())
                .map_err(|e| connect_error(e.to_string()))?;
            let io = connector
                .connect(name, tcp)
                .await
                .map_err(|e| connect_error(e.to_string()))?;
            handshake(origin, io).await
        } else {
            handshake(origin, tcp).await
        }
    }
}

fn tls_connector(trust: &TlsTrust) -> std::result::Result<TlsConnector, String> {
    let mut roots = RootCertStore::empty();
    for der in &trust.roots {
        roots
            .add(CertificateDer::from(der.clone()))
            .map_err(|e| e.to_string())?;
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn handshake<T>(origin: &Origin, io: T) -> Result<Arc<dyn Connection>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (send_request, connection) = client::handshake(io).await.map_err(|e| ErrorKind::Connect {
        origin: origin.clone(),
        reason: e.to_string(),
    })?;

    // The driver task owns the connection; its outcome is the close cause.
    let (close_tx, close_rx) = watch::channel(None::<CloseCause>);
    let driver_origin = origin.clone();
    tokio::spawn(async move {
        let cause = match connection.await {
            Ok(()) => CloseCause::Closed,
            Err(e) if e.is_go_away() => {
                debug!("connection to {driver_origin} received a goaway frame");
                CloseCause::GoAway
            }
            Err(e) => CloseCause::Error(e.to_string()),
        };
        close_tx.send_replace(Some(cause));
    });

    Ok(Arc::new(H2Connection {
        send_request: Mutex::new(Some(send_request)),
        // client-initiated stream identifiers are odd, starting at 1
        next_stream_id: AtomicU64::new(1),
        closed: close_rx,
    }))
}

struct H2Connection {
    send_request: Mutex<Option<SendRequest<Bytes>>>,
    next_stream_id: AtomicU64,
    closed: watch::Receiver<Option<CloseCause>>,
}

#[async_trait]
impl Connection for H2Connection {
    async fn open_stream(
        &self,
        head: RequestHead,
    ) -> std::result::Result<Box<dyn StreamTransport>, RejectReason> {
        let mut guard = self.send_request.lock().await;
        let sender = guard.as_mut().ok_or(RejectReason::StreamClosed)?;

        // respects the remote's concurrent stream limit
        poll_fn(|cx| sender.poll_ready(cx))
            .await
            .map_err(reject_reason)?;

        let request = build_request(&head)?;
        let (response, send) = sender.send_request(request, false).map_err(reject_reason)?;
        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);

        Ok(Box::new(H2Stream {
            id,
            response: Some(response),
            send,
            recv: None,
        }))
    }

    async fn closed(&self) -> CloseCause {
        let mut rx = self.closed.clone();
        let cause = match rx.wait_for(|cause| cause.is_some()).await {
            Ok(value) => value.clone(),
            // driver gone without reporting; treat as a plain close
            Err(_) => None,
        };
        cause.unwrap_or(CloseCause::Closed)
    }

    fn close(&self) {
        // dropping the handle lets h2 wind the connection down once
        // in-flight streams settle
        if let Ok(mut guard) = self.send_request.try_lock() {
            guard.take();
        }
    }
}

fn build_request(head: &RequestHead) -> std::result::Result<http::Request<()>, RejectReason> {
    let uri = format!(
        "{}://{}{}",
        head.origin.scheme(),
        head.origin.authority(),
        head.path_and_query
    );

    let mut request = http::Request::builder()
        .method(head.method.clone())
        .uri(uri)
        .body(())
        .map_err(|e| RejectReason::Other(e.to_string()))?;
    *request.headers_mut() = head.headers.clone();

    Ok(request)
}

struct H2Stream {
    id: u64,
    response: Option<ResponseFuture>,
    send: SendStream<Bytes>,
    recv: Option<RecvStream>,
}

#[async_trait]
impl StreamTransport for H2Stream {
    fn id(&self) -> Option<u64> {
        // h2 assigns the identifier at send_request time
        Some(self.id)
    }

    async fn ready(&mut self) -> std::result::Result<(), RejectReason> {
        Ok(())
    }

    async fn send_body(&mut self, mut body: Bytes) -> std::result::Result<(), RejectReason> {
        if body.is_empty() {
            return self.send.send_data(Bytes::new(), true).map_err(reject_reason);
        }

        while !body.is_empty() {
            self.send.reserve_capacity(body.len());
            let granted = poll_fn(|cx| self.send.poll_capacity(cx))
                .await
                .ok_or(RejectReason::StreamClosed)?
                .map_err(reject_reason)?;

            let chunk = body.split_to(granted.min(body.len()));
            let end = body.is_empty();
            self.send.send_data(chunk, end).map_err(reject_reason)?;
        }

        Ok(())
    }

    async fn response(&mut self) -> std::result::Result<ResponseHead, RejectReason> {
        let pending = self
            .response
            .take()
            .ok_or_else(|| RejectReason::Other("response already consumed".into()))?;

        let response = pending.await.map_err(reject_reason)?;
        let (parts, recv) = response.into_parts();
        self.recv = Some(recv);

        Ok(ResponseHead {
            status: parts.status,
            headers: parts.headers,
        })
    }

    async fn body(&mut self) -> std::result::Result<Bytes, RejectReason> {
        let Some(recv) = self.recv.as_mut() else {
            return Ok(Bytes::new());
        };

        let mut buf = BytesMut::new();
        while let Some(chunk) = recv.data().await {
            let chunk = chunk.map_err(reject_reason)?;
            // hand the consumed window back to the remote
            let _ = recv.flow_control().release_capacity(chunk.len());
            buf.extend_from_slice(&chunk);
        }
        self.recv = None;

        Ok(buf.freeze())
    }

    fn abort(&mut self) {
        self.send.send_reset(Reason::CANCEL);
    }
}

fn reject_reason(err: h2::Error) -> RejectReason {
    match err.reason() {
        Some(Reason::STREAM_CLOSED) => RejectReason::StreamClosed,
        Some(Reason::REFUSED_STREAM) => RejectReason::RefusedStream,
        Some(Reason::ENHANCE_YOUR_CALM) => RejectReason::EnhanceYourCalm,
        Some(Reason::CANCEL) => RejectReason::Cancelled,
        _ => RejectReason::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use url::Url;

    #[test]
    fn test_reject_reason_mapping() {
        assert_eq!(
            reject_reason(h2::Error::from(Reason::REFUSED_STREAM)),
            RejectReason::RefusedStream
        );
        assert_eq!(
            reject_reason(h2::Error::from(Reason::ENHANCE_YOUR_CALM)),
            RejectReason::EnhanceYourCalm
        );
        assert_eq!(
            reject_reason(h2::Error::from(Reason::CANCEL)),
            RejectReason::Cancelled
        );
        assert!(matches!(
            reject_reason(h2::Error::from(Reason::PROTOCOL_ERROR)),
            RejectReason::Other(_)
        ));
    }

    #[test]
    fn test_build_request_carries_pseudo_headers() {
        let url = Url::parse("http://example.com:8000/a/b").unwrap();
        let origin = Origin::try_from(&url).unwrap();
        let head = RequestHead {
            method: Method::POST,
            origin,
            path_and_query: "/a/b?key=value".into(),
            headers: http::HeaderMap::new(),
        };

        let request = build_request(&head).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().path(), "/a/b");
        assert_eq!(request.uri().query(), Some("key=value"));
        assert_eq!(request.uri().host(), Some("example.com"));
        assert_eq!(request.uri().port_u16(), Some(8000));
    }
}
