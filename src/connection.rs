//! Control-port connection management and the controller facade.
//!
//! This module owns the socket. One [`Controller`] corresponds to one
//! control-port connection; a [`ControllerRegistry`] memoizes at most one
//! connection per `host:port` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Controller                                │
//! │                                                                  │
//! │   socket read half ──▶ reader task                               │
//! │        LineFramer ─▶ MessageAssembler ─▶ Dispatcher              │
//! │                                     │                            │
//! │              ┌──────────────────────┴──────────────┐             │
//! │              ▼ (2xx/4xx/5xx)                       ▼ (650)       │
//! │        reply channel ─▶ command pipeline     watch_event         │
//! │              │            (FIFO queue,       subscriptions       │
//! │              │          one in flight)                           │
//! │              ▼                                                   │
//! │        reply sinks (oneshot, one per command)                    │
//! │                                                                  │
//! │   socket write half ◀── head-of-queue command writes             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Command pipeline
//!
//! Commands are queued FIFO, and at most one is in flight: the head of the
//! queue is written to the socket, and the next command is written only
//! when the head's reply arrives. Each command resolves exactly once —
//! success, protocol error (`4xx`/`5xx` replies still consume the
//! head-of-queue slot), or [`Error::ConnectionLost`] when the connection
//! goes away first.
//!
//! # Lifecycle
//!
//! Opening a connection writes `authenticate` as the first queued command
//! and `setevents stream circ` as the second; the caller gets the handle
//! only after both succeed. [`Controller::close`] is idempotent; it tears
//! down the socket and aborts every pending command. The connection never
//! reconnects on its own.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::dispatch::{Dispatcher, RegistrationId};
use crate::error::{Error, Result};
use crate::events::{EventRecord, EventType};
use crate::framing::{ControlMessage, LineFramer, MessageAssembler};
use crate::getinfo::{self, InfoValue};

/// Sink invoked exactly once when the connection dies to a transport
/// failure. Configured at connection creation; when absent, the failure is
/// logged at warn level instead.
pub type ErrorSink = Box<dyn FnOnce(Error) + Send>;

/// A submitted command awaiting its reply.
struct PendingCommand {
    text: String,
    sink: oneshot::Sender<Result<ControlMessage>>,
}

/// Queue state plus the write half of the socket.
struct Pipeline {
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    queue: VecDeque<PendingCommand>,
    error_sink: Option<ErrorSink>,
    closed: bool,
}

impl Pipeline {
    /// Writes one CRLF-terminated command to the socket.
    async fn write_command(&mut self, text: &str) -> std::io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")
        })?;
        writer.write_all(text.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await
    }

    /// Aborts every queued command with a connection-lost error.
    fn drain(&mut self) {
        for command in self.queue.drain(..) {
            let _ = command.sink.send(Err(Error::ConnectionLost));
        }
    }
}

/// State shared between the controller handle and its background tasks.
struct Shared {
    endpoint: String,
    dispatcher: StdMutex<Dispatcher>,
    pipeline: Mutex<Pipeline>,
}

impl Shared {
    /// Queues a command; writes it immediately if the queue was idle.
    ///
    /// Returns the receiver the reply will arrive on. Submission itself
    /// never waits for the reply.
    async fn enqueue(&self, text: String) -> Result<oneshot::Receiver<Result<ControlMessage>>> {
        let (tx, rx) = oneshot::channel();
        let mut pipeline = self.pipeline.lock().await;
        if pipeline.closed {
            return Err(Error::ConnectionLost);
        }
        let idle = pipeline.queue.is_empty();
        pipeline.queue.push_back(PendingCommand { text, sink: tx });
        if idle {
            let head = match pipeline.queue.front() {
                Some(command) => command.text.clone(),
                None => return Err(Error::ConnectionLost),
            };
            if let Err(e) = pipeline.write_command(&head).await {
                self.abort_locked(&mut pipeline, Error::Io(e));
                return Err(Error::ConnectionLost);
            }
        }
        Ok(rx)
    }

    /// Binds a reply to the head-of-queue command and advances the queue.
    async fn complete_reply(&self, message: ControlMessage) {
        let mut pipeline = self.pipeline.lock().await;
        let Some(pending) = pipeline.queue.pop_front() else {
            warn!(endpoint = %self.endpoint, "reply with no command outstanding: {}", message.raw);
            return;
        };
        trace!(command = %pending.text, status = message.status, "reply delivered");

        let result = if message.is_error() {
            Err(Error::Protocol {
                status: message.status,
                message: message.raw,
            })
        } else {
            Ok(message)
        };
        // A dropped receiver must not stall the pipeline.
        let _ = pending.sink.send(result);

        if let Some(next) = pipeline.queue.front() {
            let text = next.text.clone();
            if let Err(e) = pipeline.write_command(&text).await {
                self.abort_locked(&mut pipeline, Error::Io(e));
            }
        }
    }

    /// Transport-failure teardown; the error sink fires at most once.
    fn abort_locked(&self, pipeline: &mut Pipeline, error: Error) {
        if pipeline.closed {
            return;
        }
        pipeline.closed = true;
        pipeline.writer = None;
        pipeline.drain();
        match pipeline.error_sink.take() {
            Some(sink) => sink(error),
            None => warn!(endpoint = %self.endpoint, "control connection lost: {}", error),
        }
    }

    async fn abort(&self, error: Error) {
        let mut pipeline = self.pipeline.lock().await;
        self.abort_locked(&mut pipeline, error);
    }

    /// Deliberate close: no error-sink notification.
    async fn close(&self) {
        let mut pipeline = self.pipeline.lock().await;
        if pipeline.closed {
            return;
        }
        pipeline.closed = true;
        if let Some(mut writer) = pipeline.writer.take() {
            let _ = writer.shutdown().await;
        }
        pipeline.drain();
    }
}

/// Reads the socket, frames lines, assembles messages, dispatches them.
async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut assembler = MessageAssembler::new();
    let mut buf = vec![0u8; 4096];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(endpoint = %shared.endpoint, "control socket reached EOF");
                shared.abort(Error::ConnectionLost).await;
                return;
            }
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                for line in framer.push(&chunk) {
                    if let Some(message) = assembler.push_line(line) {
                        shared.dispatcher.lock().unwrap().dispatch(&message);
                    }
                }
            }
            Err(e) => {
                shared.abort(Error::Io(e)).await;
                return;
            }
        }
    }
}

/// Quotes a secret for the `authenticate` command.
fn quote_secret(secret: &str) -> String {
    let escaped = secret.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Handle to one authenticated control-port connection.
///
/// Cheap to share behind an [`Arc`]; all operations take `&self`.
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Connects over TCP and authenticates.
    ///
    /// Equivalent to [`launch`](Self::launch) over a fresh `TcpStream`,
    /// with no transport-error sink.
    pub async fn connect(host: &str, port: u16, password: &str) -> Result<Controller> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::launch(format!("{}:{}", host, port), stream, password, None).await
    }

    /// Builds a connection over an arbitrary duplex transport.
    ///
    /// Spawns the reader and reply-routing tasks, installs the default
    /// dispatch registrations, then queues `authenticate` and
    /// `setevents stream circ`. Returns only after both replies arrive.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] when authentication or event subscription is
    /// refused (e.g. `515` on a bad password); transport errors as
    /// [`Error::Io`] / [`Error::ConnectionLost`]. On error the connection
    /// is closed before returning.
    pub async fn launch<S>(
        endpoint: String,
        stream: S,
        password: &str,
        error_sink: Option<ErrorSink>,
    ) -> Result<Controller>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let shared = Arc::new(Shared {
            endpoint,
            dispatcher: StdMutex::new(Dispatcher::new()),
            pipeline: Mutex::new(Pipeline {
                writer: Some(Box::new(write_half)),
                queue: VecDeque::new(),
                error_sink,
                closed: false,
            }),
        });

        // Default routing: replies feed the command pipeline through an
        // ordered channel; events reach watch_event registrations, with a
        // trace fallback so unobserved events are visible when debugging.
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ControlMessage>();
        {
            let mut dispatcher = shared.dispatcher.lock().unwrap();
            dispatcher.register(
                Box::new(|message: &ControlMessage| message.is_reply()),
                Box::new(move |message| {
                    let _ = reply_tx.send(message.clone());
                }),
            );
            dispatcher.register(
                Box::new(|message: &ControlMessage| message.is_async_event()),
                Box::new(|message| {
                    trace!(status = message.status, "asynchronous event: {}", message.raw);
                }),
            );
        }

        tokio::spawn(read_loop(shared.clone(), read_half));
        let router = shared.clone();
        tokio::spawn(async move {
            while let Some(message) = reply_rx.recv().await {
                router.complete_reply(message).await;
            }
        });

        let controller = Controller { shared };

        let auth = if password.is_empty() {
            "authenticate".to_string()
        } else {
            format!("authenticate {}", quote_secret(password))
        };
        if let Err(e) = controller.submit(auth).await {
            controller.close().await;
            return Err(e);
        }
        if let Err(e) = controller.submit("setevents stream circ".to_string()).await {
            controller.close().await;
            return Err(e);
        }

        Ok(controller)
    }

    /// The `host:port` this connection serves.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Queues a command and waits for its reply.
    pub(crate) async fn submit(&self, command: String) -> Result<ControlMessage> {
        let rx = self.shared.enqueue(command).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// Queues a command without waiting; the reply arrives on the receiver.
    #[cfg(test)]
    pub(crate) async fn enqueue(
        &self,
        command: String,
    ) -> Result<oneshot::Receiver<Result<ControlMessage>>> {
        self.shared.enqueue(command).await
    }

    /// Reads one `GETINFO` key.
    ///
    /// The key is validated against the capability table before anything is
    /// written to the socket. No deadline is applied; wrap the call in
    /// [`tokio::time::timeout`] if one is needed.
    ///
    /// # Errors
    ///
    /// Key-classification errors ([`Error::UnsupportedKey`],
    /// [`Error::DeprecatedKey`], [`Error::UnknownKey`]) before submission;
    /// [`Error::Protocol`], [`Error::Parse`], or [`Error::ConnectionLost`]
    /// afterwards.
    pub async fn get_info(&self, key: &str) -> Result<InfoValue> {
        let mut values = self.get_info_multiple(&[key]).await?;
        values
            .remove(key)
            .ok_or_else(|| Error::Parse(format!("reply did not contain key {}", key)))
    }

    /// Reads several `GETINFO` keys in one request.
    ///
    /// The request fails as a unit: if any key is refused by the
    /// capability table, no bytes are sent.
    ///
    /// # Errors
    ///
    /// As [`get_info`](Self::get_info).
    pub async fn get_info_multiple<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> Result<HashMap<String, InfoValue>> {
        let request = getinfo::format_request(keys)?;
        let reply = self.submit(request).await?;
        getinfo::parse_response(&reply)
    }

    /// Subscribes to `650 <type>` events.
    ///
    /// Each matching event is parsed into an [`EventRecord`] and offered to
    /// `filter`; `handler` runs only when `filter` returns true. Handlers
    /// run on the connection's reader task and must not block. Malformed
    /// events are dropped with a debug log.
    pub fn watch_event<F, H>(&self, event: EventType, filter: F, handler: H) -> EventSubscription
    where
        F: Fn(&EventRecord) -> bool + Send + 'static,
        H: Fn(&EventRecord) + Send + 'static,
    {
        let prefix = format!("650 {} ", event.keyword());
        let id = self.shared.dispatcher.lock().unwrap().register(
            Box::new(move |message: &ControlMessage| {
                message.is_async_event() && message.raw.starts_with(&prefix)
            }),
            Box::new(move |message| match EventRecord::parse(message) {
                Ok(record) => {
                    if filter(&record) {
                        handler(&record);
                    }
                }
                Err(e) => debug!("dropping malformed event: {}", e),
            }),
        );
        EventSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Closes the connection. Idempotent.
    ///
    /// Every pending command resolves with [`Error::ConnectionLost`];
    /// later submissions are refused the same way.
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("endpoint", &self.shared.endpoint)
            .finish()
    }
}

/// Deregistration handle returned by [`Controller::watch_event`].
///
/// Dropping the handle leaves the subscription active; call
/// [`cancel`](Self::cancel) to remove it.
pub struct EventSubscription {
    id: RegistrationId,
    shared: Weak<Shared>,
}

impl EventSubscription {
    /// Removes the subscription from the dispatcher.
    pub fn cancel(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatcher.lock().unwrap().unregister(self.id);
        }
    }
}

/// Process-wide connection cache: at most one connection per endpoint.
///
/// Created on first [`open`](Self::open) for an endpoint; destroyed by
/// [`close`](Self::close) / [`close_all`](Self::close_all), which also
/// remove the cache entry. The registry is an owned value passed by
/// reference, not global state.
#[derive(Default)]
pub struct ControllerRegistry {
    connections: Mutex<HashMap<String, Arc<Controller>>>,
}

impl ControllerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection for `host:port`, connecting on first use.
    ///
    /// The cache lock is held across connection setup, so two concurrent
    /// `open` calls for the same endpoint cannot race into two sockets.
    ///
    /// # Errors
    ///
    /// Connection or authentication errors from [`Controller::connect`];
    /// nothing is cached on failure.
    pub async fn open(&self, host: &str, port: u16, password: &str) -> Result<Arc<Controller>> {
        let endpoint = format!("{}:{}", host, port);
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&endpoint) {
            return Ok(existing.clone());
        }
        let controller = Arc::new(Controller::connect(host, port, password).await?);
        connections.insert(endpoint, controller.clone());
        Ok(controller)
    }

    /// Closes and forgets the connection for `host:port`, if cached.
    pub async fn close(&self, host: &str, port: u16) {
        let endpoint = format!("{}:{}", host, port);
        let removed = self.connections.lock().await.remove(&endpoint);
        if let Some(controller) = removed {
            controller.close().await;
        }
    }

    /// Closes and forgets every cached connection.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Controller>> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, controller)| controller).collect()
        };
        for controller in drained {
            controller.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(50);

    async fn read_command(server: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    async fn send(server: &mut BufReader<DuplexStream>, text: &str) {
        server.get_mut().write_all(text.as_bytes()).await.unwrap();
    }

    /// Connects a controller to a scripted in-memory server, completing
    /// the authenticate + setevents handshake.
    async fn connect_pair(
        password: &str,
        error_sink: Option<ErrorSink>,
    ) -> (Controller, BufReader<DuplexStream>) {
        let (client, server) = duplex(16 * 1024);
        let mut server = BufReader::new(server);

        let launch = Controller::launch("test:9151".to_string(), client, password, error_sink);
        let handshake = async {
            let auth = read_command(&mut server).await;
            assert!(auth.starts_with("authenticate"));
            send(&mut server, "250 OK\r\n").await;
            assert_eq!(read_command(&mut server).await, "setevents stream circ");
            send(&mut server, "250 OK\r\n").await;
        };
        let (controller, ()) = tokio::join!(launch, handshake);
        (controller.unwrap(), server)
    }

    #[test]
    fn test_quote_secret() {
        assert_eq!(quote_secret("hunter2"), "\"hunter2\"");
        assert_eq!(quote_secret(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[tokio::test]
    async fn test_handshake_commands_and_order() {
        let (client, server) = duplex(16 * 1024);
        let mut server = BufReader::new(server);

        let launch = Controller::launch("test:9151".to_string(), client, "opensesame", None);
        let handshake = async {
            // Authentication is the first queued command; setevents must
            // not be written before the auth reply arrives.
            assert_eq!(
                read_command(&mut server).await,
                "authenticate \"opensesame\""
            );
            assert!(timeout(TICK, read_command(&mut server)).await.is_err());
            send(&mut server, "250 OK\r\n").await;
            assert_eq!(read_command(&mut server).await, "setevents stream circ");
            send(&mut server, "250 OK\r\n").await;
        };
        let (controller, ()) = tokio::join!(launch, handshake);
        controller.unwrap();
    }

    #[tokio::test]
    async fn test_empty_password_sends_bare_authenticate() {
        let (client, server) = duplex(16 * 1024);
        let mut server = BufReader::new(server);

        let launch = Controller::launch("test:9151".to_string(), client, "", None);
        let handshake = async {
            assert_eq!(read_command(&mut server).await, "authenticate");
            send(&mut server, "250 OK\r\n").await;
            assert_eq!(read_command(&mut server).await, "setevents stream circ");
            send(&mut server, "250 OK\r\n").await;
        };
        let (controller, ()) = tokio::join!(launch, handshake);
        controller.unwrap();
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let (client, server) = duplex(16 * 1024);
        let mut server = BufReader::new(server);

        let launch = Controller::launch("test:9151".to_string(), client, "wrong", None);
        let handshake = async {
            let _ = read_command(&mut server).await;
            send(&mut server, "515 Authentication failed\r\n").await;
        };
        let (result, ()) = tokio::join!(launch, handshake);
        assert!(matches!(result, Err(Error::Protocol { status: 515, .. })));
    }

    #[tokio::test]
    async fn test_strict_one_in_flight_ordering() {
        // Scenario S2: back-to-back commands, strict pairing.
        let (controller, mut server) = connect_pair("pw", None).await;

        let rx_a = controller.enqueue("getinfo version".to_string()).await.unwrap();
        let rx_b = controller
            .enqueue("getinfo config-file".to_string())
            .await
            .unwrap();
        let rx_c = controller.enqueue("getinfo address".to_string()).await.unwrap();

        // Only the head command reaches the socket.
        assert_eq!(read_command(&mut server).await, "getinfo version");
        assert!(timeout(TICK, read_command(&mut server)).await.is_err());

        send(&mut server, "250-version=0.4.8.10\r\n250 OK\r\n").await;
        let reply_a = rx_a.await.unwrap().unwrap();
        assert!(reply_a.raw.contains("version=0.4.8.10"));

        assert_eq!(read_command(&mut server).await, "getinfo config-file");
        send(&mut server, "250-config-file=/etc/tor/torrc\r\n250 OK\r\n").await;
        let reply_b = rx_b.await.unwrap().unwrap();
        assert!(reply_b.raw.contains("config-file=/etc/tor/torrc"));

        // An error reply still consumes the head-of-queue slot.
        assert_eq!(read_command(&mut server).await, "getinfo address");
        send(&mut server, "551 Internal error\r\n").await;
        let err = rx_c.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol { status: 551, .. }));
    }

    #[tokio::test]
    async fn test_event_demultiplexed_from_reply() {
        // Scenario S3: an event arriving mid-command reaches the stream
        // handler first and never leaks into the command's reply.
        let (controller, mut server) = connect_pair("pw", None).await;

        let order = Arc::new(StdMutex::new(Vec::<String>::new()));
        let seen = order.clone();
        let _sub = controller.watch_event(
            EventType::Stream,
            |_| true,
            move |record| {
                seen.lock()
                    .unwrap()
                    .push(format!("event:{}", record.arg(0).unwrap_or("")));
            },
        );

        let rx = controller.enqueue("getinfo version".to_string()).await.unwrap();
        assert_eq!(read_command(&mut server).await, "getinfo version");

        send(&mut server, "650 STREAM 7 SENTCONNECT 4 example.com:443\r\n").await;
        send(&mut server, "250-version=1\r\n250 OK\r\n").await;

        let reply = rx.await.unwrap().unwrap();
        order.lock().unwrap().push("reply".to_string());

        assert_eq!(*order.lock().unwrap(), vec!["event:7", "reply"]);
        assert!(!reply.raw.contains("STREAM"));
    }

    #[tokio::test]
    async fn test_watch_event_filter_and_type_matching() {
        let (controller, mut server) = connect_pair("pw", None).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let sub = controller.watch_event(
            EventType::Circ,
            |record| record.arg(1) == Some("BUILT"),
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );

        send(&mut server, "650 CIRC 4 BUILT $AA~a\r\n").await;
        send(&mut server, "650 CIRC 5 LAUNCHED\r\n").await;
        send(&mut server, "650 STREAM 7 NEW 0 example.com:443\r\n").await;
        // Round-trip a command to be sure all three events were dispatched.
        let echo = async {
            assert_eq!(read_command(&mut server).await, "getinfo version");
            send(&mut server, "250-version=1\r\n250 OK\r\n").await;
        };
        let (reply, ()) = tokio::join!(controller.get_info("version"), echo);
        reply.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // After cancellation the handler no longer fires.
        sub.cancel();
        send(&mut server, "650 CIRC 6 BUILT $BB~b\r\n").await;
        let echo = async {
            assert_eq!(read_command(&mut server).await, "getinfo version");
            send(&mut server, "250-version=1\r\n250 OK\r\n").await;
        };
        let (reply, ()) = tokio::join!(controller.get_info("version"), echo);
        reply.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_key_writes_no_bytes() {
        // Scenario S5: the rejected request never reaches the socket; the
        // next thing the server sees is the follow-up valid request.
        let (controller, mut server) = connect_pair("pw", None).await;

        let err = controller.get_info("entry-guards").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedKey(_)));

        let echo = async {
            assert_eq!(read_command(&mut server).await, "getinfo version");
            send(&mut server, "250-version=0.4.8.10\r\n250 OK\r\n").await;
        };
        let (value, ()) = tokio::join!(controller.get_info("version"), echo);
        assert_eq!(value.unwrap().as_str(), Some("0.4.8.10"));
    }

    #[tokio::test]
    async fn test_get_info_multiple_multiline() {
        // Scenario S1 end-to-end: bytes in, typed key/value out.
        let (controller, mut server) = connect_pair("pw", None).await;

        let echo = async {
            assert_eq!(
                read_command(&mut server).await,
                "getinfo config-text traffic/read"
            );
            send(
                &mut server,
                "250+config-text=\r\nControlPort 9151\r\nSocksPort 9150\r\n.\r\n250-traffic/read=4096\r\n250 OK\r\n",
            )
            .await;
        };
        let (values, ()) = tokio::join!(
            controller.get_info_multiple(&["config-text", "traffic/read"]),
            echo
        );
        let values = values.unwrap();

        assert_eq!(
            values["config-text"].as_str(),
            Some("ControlPort 9151\r\nSocksPort 9150")
        );
        assert_eq!(values["traffic/read"].as_integer(), Some(4096));
    }

    #[tokio::test]
    async fn test_close_aborts_pending_commands() {
        let (controller, mut server) = connect_pair("pw", None).await;

        let rx_a = controller.enqueue("getinfo version".to_string()).await.unwrap();
        let rx_b = controller.enqueue("getinfo address".to_string()).await.unwrap();
        assert_eq!(read_command(&mut server).await, "getinfo version");

        controller.close().await;
        controller.close().await; // idempotent

        assert!(matches!(rx_a.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(rx_b.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(
            controller.submit("getinfo version".to_string()).await,
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_notifies_sink_once() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Error>();
        let sink: ErrorSink = Box::new(move |error| {
            let _ = sink_tx.send(error);
        });
        let (controller, server) = connect_pair("pw", Some(sink)).await;

        let rx = controller.enqueue("getinfo version".to_string()).await.unwrap();
        drop(server);

        // Pending command aborted, sink notified exactly once.
        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(sink_rx.recv().await, Some(Error::ConnectionLost)));
        assert!(sink_rx.recv().await.is_none());
    }

    /// Minimal scripted control server for TCP registry tests: answers
    /// every command line with `250 OK`.
    async fn serve_ok(stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    if reader.get_mut().write_all(b"250 OK\r\n").await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_registry_memoizes_per_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let count = accepted.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_ok(stream));
            }
        });

        let registry = ControllerRegistry::new();
        let first = registry.open("127.0.0.1", addr.port(), "pw").await.unwrap();
        let second = registry.open("127.0.0.1", addr.port(), "pw").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        // Close removes the cache entry; a later open reconnects.
        registry.close("127.0.0.1", addr.port()).await;
        let third = registry.open("127.0.0.1", addr.port(), "pw").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        registry.close_all().await;
    }
}
