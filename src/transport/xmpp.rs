//! XMPP transport
//!
//! The relay speaks plain XMPP client streams over TCP, with TLS directly on
//! the socket. Responsibilities:
//! - open the socket and run the TLS handshake (rustls with the webpki roots)
//! - negotiate the stream: open, SASL PLAIN, restart, resource bind, presence
//! - hand inbound `<message>` stanzas to the registered listeners
//! - reconnect according to the configured `ReconnectionPolicy` when the
//!   stream drops
//! - open a replacement session while the relay drains the current one
//!
//! Every session has its own supervisor task that owns the read half. Writes
//! go through an async mutex per session so stanzas are never interleaved.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use super::framing::{Frame, StreamFramer};
use super::stanza::frame_head;
use super::{
    ConnectionEvent, ConnectionListener, Listeners, ReconnectionPolicy, Stanza, StanzaInterceptor,
    StanzaListener, Transport, TransportConfig,
};
use crate::utils::error::TransportError;

const STREAM_NS: &str = "http://etherx.jabber.org/streams";
const CLIENT_NS: &str = "jabber:client";
const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const READ_CHUNK: usize = 8 * 1024;

trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Socket for S {}

type BoxedSocket = Box<dyn Socket>;

#[derive(Clone, Default)]
pub struct XmppTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    listeners: Listeners,
    config: Mutex<Option<TransportConfig>>,
    policy: Mutex<Option<ReconnectionPolicy>>,
    current: Mutex<Option<Arc<Session>>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    next_session: AtomicU64,
    closing: AtomicBool,
}

/// One TCP (or TLS) connection and its XML stream.
struct Session {
    id: u64,
    reader: tokio::sync::Mutex<StreamReader>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedSocket>>>,
}

struct StreamReader {
    half: ReadHalf<BoxedSocket>,
    framer: StreamFramer,
    chunk: Vec<u8>,
}

impl XmppTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for XmppTransport {
    async fn connect(&self, config: &TransportConfig) -> Result<(), TransportError> {
        self.inner.closing.store(false, Ordering::SeqCst);
        *lock(&self.inner.config) = Some(config.clone());

        let session = self.inner.open_session(config).await?;
        *lock(&self.inner.current) = Some(session);
        self.inner.listeners.notify(&ConnectionEvent::Connected);
        Ok(())
    }

    async fn login(&self) -> Result<(), TransportError> {
        let config = self.inner.config()?;
        let session = self.inner.current()?;
        session.negotiate(&config).await?;

        self.inner
            .listeners
            .notify(&ConnectionEvent::Authenticated { resumed: false });
        self.inner.spawn_supervisor(session);
        Ok(())
    }

    async fn send_stanza(&self, stanza: Stanza) -> Result<(), TransportError> {
        let session = self.inner.current()?;
        self.inner.listeners.intercept(&stanza);
        session.write(stanza.xml()).await
    }

    fn add_incoming_message_listener(&self, listener: StanzaListener) {
        self.inner.listeners.add_incoming(listener);
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        self.inner.listeners.add_connection(listener);
    }

    fn add_outgoing_interceptor(&self, interceptor: StanzaInterceptor) {
        self.inner.listeners.add_outgoing(interceptor);
    }

    fn enable_automatic_reconnection(&self, policy: ReconnectionPolicy) {
        *lock(&self.inner.policy) = Some(policy);
    }

    async fn replace_session(&self) -> Result<(), TransportError> {
        let config = self.inner.config()?;
        let session = self.inner.open_session(&config).await?;
        if let Err(e) = session.negotiate(&config).await {
            let _ = session.close().await;
            return Err(e);
        }
        if self.inner.closing.load(Ordering::SeqCst) {
            let _ = session.close().await;
            return Err(TransportError::Closed);
        }

        let previous = lock(&self.inner.current).replace(session.clone());
        if let Some(previous) = previous {
            info!(
                "Session {} replaces draining session {}",
                session.id, previous.id
            );
        }
        self.inner.spawn_supervisor(session);
        self.inner.listeners.notify(&ConnectionEvent::SessionReplaced);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.closing.store(true, Ordering::SeqCst);
        for handle in lock(&self.inner.supervisors).drain(..) {
            handle.abort();
        }

        let Some(session) = lock(&self.inner.current).take() else {
            return Ok(());
        };
        let closed = session.close().await;

        self.inner.listeners.notify(&ConnectionEvent::Closed);
        info!("Disconnected from relay");
        closed
    }
}

impl Inner {
    fn config(&self) -> Result<TransportConfig, TransportError> {
        lock(&self.config).clone().ok_or(TransportError::NotConnected)
    }

    fn current(&self) -> Result<Arc<Session>, TransportError> {
        lock(&self.current).clone().ok_or(TransportError::NotConnected)
    }

    fn is_current(&self, session: &Session) -> bool {
        lock(&self.current)
            .as_ref()
            .is_some_and(|current| current.id == session.id)
    }

    async fn open_session(&self, config: &TransportConfig) -> Result<Arc<Session>, TransportError> {
        let endpoint = config.endpoint();
        let connect_error = |reason: String| TransportError::Connect {
            endpoint: endpoint.clone(),
            reason,
        };

        let tcp = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout("tcp connect"))?
        .map_err(|e| connect_error(e.to_string()))?;
        tcp.set_nodelay(true)?;

        let socket: BoxedSocket = if config.secure {
            let server_name = ServerName::try_from(config.host.clone())
                .map_err(|e| connect_error(format!("invalid server name: {e}")))?;
            let tls = tokio::time::timeout(
                config.connect_timeout,
                tls_connector().connect(server_name, tcp),
            )
            .await
            .map_err(|_| TransportError::Timeout("tls handshake"))?
            .map_err(|e| connect_error(format!("tls handshake failed: {e}")))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let (read, write) = tokio::io::split(socket);
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        info!("Connected to {endpoint} (session {id})");
        Ok(Arc::new(Session {
            id,
            reader: tokio::sync::Mutex::new(StreamReader {
                half: read,
                framer: StreamFramer::new(),
                chunk: vec![0; READ_CHUNK],
            }),
            writer: tokio::sync::Mutex::new(Some(write)),
        }))
    }

    fn spawn_supervisor(self: &Arc<Self>, session: Arc<Session>) {
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.supervise(session).await });

        let mut supervisors = lock(&self.supervisors);
        supervisors.retain(|handle| !handle.is_finished());
        supervisors.push(handle);
    }

    /// Reads until the stream ends. `Ok` means the relay closed it.
    async fn pump(&self, session: &Session) -> Result<(), TransportError> {
        let mut reader = session.reader.lock().await;
        loop {
            match reader.next().await {
                Ok(Frame::Element(xml)) => match frame_head(&xml) {
                    Ok((name, _)) if name == "message" => {
                        self.listeners.deliver(Stanza::from_xml(xml));
                    }
                    Ok((name, _)) if name == "error" => return Err(TransportError::Stream(xml)),
                    Ok((name, _)) => debug!("Ignoring <{name}> from relay"),
                    Err(e) => warn!("Unparseable stanza from relay: {e}"),
                },
                Ok(Frame::StreamClose) | Err(TransportError::Closed) => return Ok(()),
                Ok(Frame::StreamOpen(header)) => debug!("Ignoring repeated stream header {header}"),
                Err(e) => return Err(e),
            }
        }
    }

    async fn supervise(self: Arc<Self>, session: Arc<Session>) {
        let mut session = session;
        loop {
            let outcome = self.pump(&session).await;
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            if !self.is_current(&session) {
                info!("Drained session {} ended: {outcome:?}", session.id);
                let _ = session.close().await;
                return;
            }

            let reason = match outcome {
                Ok(()) => "stream closed by relay".to_string(),
                Err(e) => e.to_string(),
            };
            warn!("Connection lost: {reason}");
            lock(&self.current).take();
            let _ = session.close().await;
            self.listeners.notify(&ConnectionEvent::ClosedOnError(reason));

            let Some(policy) = *lock(&self.policy) else {
                return;
            };
            match self.reconnect(policy).await {
                Some(next) => session = next,
                None => return,
            }
        }
    }

    /// Retries until a new session is negotiated. Returns `None` when the
    /// transport was closed, or another session took over, meanwhile.
    async fn reconnect(&self, policy: ReconnectionPolicy) -> Option<Arc<Session>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let delay = policy.delay_for(attempt);
            info!("Reconnecting in {}ms (attempt {attempt})", delay.as_millis());
            self.listeners
                .notify(&ConnectionEvent::ReconnectingIn(delay));
            tokio::time::sleep(delay).await;

            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            if lock(&self.current).is_some() {
                debug!("A replacement session is already active");
                return None;
            }

            match self.reestablish().await {
                Ok(session) => {
                    info!("Reconnection successful");
                    *lock(&self.current) = Some(session.clone());
                    self.listeners
                        .notify(&ConnectionEvent::ReconnectionSuccessful);
                    return Some(session);
                }
                Err(e) => {
                    error!("Reconnection attempt {attempt} failed: {e}");
                    self.listeners
                        .notify(&ConnectionEvent::ReconnectionFailed(e.to_string()));
                }
            }
        }
    }

    async fn reestablish(&self) -> Result<Arc<Session>, TransportError> {
        let config = self.config()?;
        let session = self.open_session(&config).await?;
        self.listeners.notify(&ConnectionEvent::Connected);
        if let Err(e) = session.negotiate(&config).await {
            let _ = session.close().await;
            return Err(e);
        }
        Ok(session)
    }
}

impl Session {
    async fn negotiate(&self, config: &TransportConfig) -> Result<(), TransportError> {
        let timeout = config.connect_timeout;
        self.open_stream(config).await?;

        let credentials = STANDARD.encode(format!("\0{}\0{}", config.username, config.password));
        self.write(&format!(
            "<auth xmlns='{SASL_NS}' mechanism='PLAIN'>{credentials}</auth>"
        ))
        .await?;
        let (name, _, frame) = self.next_element(timeout).await?;
        match name.as_str() {
            "success" => {}
            "failure" => return Err(TransportError::Authentication(frame)),
            _ => {
                return Err(TransportError::Negotiation(format!(
                    "expected SASL outcome, got {frame}"
                )));
            }
        }

        // The stream starts over after SASL.
        self.reader.lock().await.framer.reset();
        self.open_stream(config).await?;

        self.write(&format!(
            "<iq type='set' id='bind_1'><bind xmlns='{BIND_NS}'/></iq>"
        ))
        .await?;
        let (name, kind, frame) = self.next_element(timeout).await?;
        if name != "iq" || kind.as_deref() != Some("result") {
            return Err(TransportError::Negotiation(format!(
                "resource bind refused: {frame}"
            )));
        }

        self.write("<presence/>").await?;
        info!("Logged in as {} (session {})", config.username, self.id);
        Ok(())
    }

    /// Sends the stream header and waits for the relay's header and features.
    async fn open_stream(&self, config: &TransportConfig) -> Result<(), TransportError> {
        self.write(&format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='{CLIENT_NS}' xmlns:stream='{STREAM_NS}'>",
            config.domain
        ))
        .await?;

        match self.next_frame(config.connect_timeout).await? {
            Frame::StreamOpen(_) => {}
            Frame::Element(xml) => {
                return Err(TransportError::Negotiation(format!(
                    "expected stream header, got {xml}"
                )));
            }
            Frame::StreamClose => return Err(TransportError::Closed),
        }

        let (name, _, frame) = self.next_element(config.connect_timeout).await?;
        if name != "features" {
            return Err(TransportError::Negotiation(format!(
                "expected stream features, got {frame}"
            )));
        }
        Ok(())
    }

    async fn write(&self, frame: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or(TransportError::NotConnected)?;
        half.write_all(frame.as_bytes()).await?;
        half.flush().await?;
        Ok(())
    }

    async fn next_frame(&self, timeout: Duration) -> Result<Frame, TransportError> {
        let mut reader = self.reader.lock().await;
        tokio::time::timeout(timeout, reader.next())
            .await
            .map_err(|_| TransportError::Timeout("stream negotiation"))?
    }

    /// Next top-level element as `(name, type attribute, raw xml)`.
    async fn next_element(
        &self,
        timeout: Duration,
    ) -> Result<(String, Option<String>, String), TransportError> {
        match self.next_frame(timeout).await? {
            Frame::Element(xml) => {
                let (name, kind) =
                    frame_head(&xml).map_err(|e| TransportError::Negotiation(e.to_string()))?;
                if name == "error" {
                    return Err(TransportError::Stream(xml));
                }
                Ok((name, kind, xml))
            }
            Frame::StreamOpen(header) => Err(TransportError::Negotiation(format!(
                "unexpected stream header {header}"
            ))),
            Frame::StreamClose => Err(TransportError::Closed),
        }
    }

    /// Ends the stream and shuts the socket. Safe to call more than once.
    async fn close(&self) -> Result<(), TransportError> {
        let Some(mut half) = self.writer.lock().await.take() else {
            return Ok(());
        };
        let _ = half.write_all(b"</stream:stream>").await;
        half.shutdown().await?;
        Ok(())
    }
}

impl StreamReader {
    async fn next(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = self
                .framer
                .next_frame()
                .map_err(|e| TransportError::Negotiation(e.to_string()))?
            {
                return Ok(frame);
            }
            let read = self.half.read(&mut self.chunk).await?;
            if read == 0 {
                return Err(TransportError::Closed);
            }
            self.framer.push(&self.chunk[..read]);
        }
    }
}

fn tls_connector() -> TlsConnector {
    // Another component may already have installed a provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
#[path = "xmpp_tests.rs"]
mod tests;
