//! Per-connection engine: read loop, response serializer, shutdown
//! listener, StartTLS in-band upgrade, worker fan-out and teardown.

use crate::message::{Client, Message};
use crate::metrics::{metric_op_name, Metrics};
use crate::proto::{
    self, FrameResult, LdapMessage, OpKind, ProtocolOp, OID_NOTICE_OF_DISCONNECTION, OID_START_TLS,
    RESULT_OPERATIONS_ERROR, RESULT_SUCCESS, RESULT_UNWILLING_TO_PERFORM,
};
use crate::registry::OperationRegistry;
use crate::response::{new_extended_response, new_response, ResponseWriter};
use crate::route::RouteMux;
use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Deadline applied to each remaining write while the connection is being
/// torn down, so a stalled client cannot wedge the final drain.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Client stream: plain TCP or TLS-wrapped, so one engine serves ldap://,
/// ldaps:// and post-StartTLS connections alike.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Items on the per-connection outbound queue.
pub(crate) enum Outbound {
    /// One envelope to encode and write.
    Message(LdapMessage),
    /// StartTLS handoff: the serializer flushes, yields its write half over
    /// `reply`, then resumes with the post-handshake write half.
    SwapWriter {
        reply: oneshot::Sender<WriteHalf<ClientStream>>,
        new_writer: oneshot::Receiver<WriteHalf<ClientStream>>,
    },
}

/// Connection-independent pieces shared by every connection of one server.
pub(crate) struct ConnShared {
    pub routes: Arc<RouteMux>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub stop: CancellationToken,
    pub metrics: Arc<Metrics>,
}

/// Drive one accepted connection through its full lifetime.
pub(crate) async fn serve_conn(
    id: u64,
    stream: ClientStream,
    peer: SocketAddr,
    shared: Arc<ConnShared>,
) {
    let tls_active = matches!(stream, ClientStream::Tls(_));
    let registry = Arc::new(OperationRegistry::new());
    let conn_token = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<Outbound>(1);

    let (rd, wr) = tokio::io::split(stream);
    let serializer = tokio::spawn(run_serializer(
        id,
        rx,
        wr,
        shared.write_timeout,
        conn_token.clone(),
    ));
    let shutdown_listener = tokio::spawn(run_shutdown_listener(
        shared.stop.clone(),
        conn_token.clone(),
        tx.clone(),
    ));

    let client = Client::new(id, peer, Arc::clone(&registry));
    let mut engine = ConnEngine {
        id,
        shared,
        registry,
        conn_token,
        tx,
        workers: TaskTracker::new(),
        client,
        tls_active,
    };

    engine.read_loop(rd).await;
    engine.close(serializer, shutdown_listener).await;
}

struct ConnEngine {
    id: u64,
    shared: Arc<ConnShared>,
    registry: Arc<OperationRegistry>,
    conn_token: CancellationToken,
    tx: mpsc::Sender<Outbound>,
    workers: TaskTracker,
    client: Client,
    tls_active: bool,
}

impl ConnEngine {
    async fn read_loop(&mut self, mut rd: ReadHalf<ClientStream>) {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            let Some(msg) = self.next_message(&mut rd, &mut buf).await else {
                break;
            };
            if self.registry.is_closing() {
                debug!(client = self.id, "request after teardown began, discarding");
                break;
            }
            match &msg.protocol_op {
                ProtocolOp::UnbindRequest => {
                    debug!(client = self.id, "client unbind");
                    break;
                }
                ProtocolOp::ExtendedRequest(r) if r.request_name == OID_START_TLS => {
                    self.shared.metrics.inc_request("extended");
                    // Inline: no worker may race the reader/writer swap.
                    match self.start_tls(rd, msg.message_id).await {
                        Ok(new_rd) => rd = new_rd,
                        Err(e) => {
                            warn!(client = self.id, "StartTLS failed: {:#}", e);
                            break;
                        }
                    }
                }
                ProtocolOp::AbandonRequest(target_id) => {
                    self.registry.signal_abandon(*target_id);
                    // Abandon routes observe the request; otherwise nothing
                    // to do, the op itself never answers.
                    if self.shared.routes.has_abandon_route() {
                        self.dispatch(msg);
                    }
                }
                _ => self.dispatch(msg),
            }
        }
    }

    /// Frame the next message out of the stream. Returns None on EOF, read
    /// error or deadline, teardown, or an unrecoverable framing error.
    async fn next_message(
        &self,
        rd: &mut ReadHalf<ClientStream>,
        buf: &mut BytesMut,
    ) -> Option<LdapMessage> {
        loop {
            match proto::try_read_message(buf) {
                Ok(FrameResult::Message(msg)) => return Some(msg),
                Ok(FrameResult::Skip { consumed, message_id }) => {
                    self.shared.metrics.inc_parse_error();
                    debug!(
                        client = self.id,
                        msgid = message_id,
                        consumed,
                        "skipping unparseable message, framing re-synced"
                    );
                }
                Ok(FrameResult::Incomplete) => {
                    let read = async {
                        match self.shared.read_timeout {
                            Some(t) => timeout(t, rd.read_buf(buf))
                                .await
                                .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into())),
                            None => rd.read_buf(buf).await,
                        }
                    };
                    tokio::select! {
                        _ = self.conn_token.cancelled() => return None,
                        r = read => match r {
                            Ok(0) => {
                                debug!(client = self.id, "client closed connection");
                                return None;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!(client = self.id, "read error: {}", e);
                                return None;
                            }
                        },
                    }
                }
                Err(e) => {
                    self.shared.metrics.inc_parse_error();
                    error!(client = self.id, "unrecoverable framing error: {:#}", e);
                    return None;
                }
            }
        }
    }

    /// Register the operation and spawn its worker. A panicking handler is
    /// recovered and answered with OperationsError; the connection survives.
    fn dispatch(&self, msg: LdapMessage) {
        if let Some(op) = metric_op_name(msg.protocol_op.kind()) {
            self.shared.metrics.inc_request(op);
        }
        let message = Arc::new(Message::new(msg, self.client.clone()));
        let message_id = message.message_id();
        let kind = message.kind();
        self.registry.register(Arc::clone(&message));

        let w = ResponseWriter::new(self.tx.clone(), message_id, kind);
        let routes = Arc::clone(&self.shared.routes);
        let registry = Arc::clone(&self.registry);
        let conn_id = self.id;
        let _ = self.workers.spawn(async move {
            let served = {
                let w = w.clone();
                let m = Arc::clone(&message);
                AssertUnwindSafe(async move { routes.serve(w, m).await })
                    .catch_unwind()
                    .await
            };
            if let Err(panic) = served {
                error!(
                    client = conn_id,
                    msgid = message_id,
                    "handler panicked: {}",
                    panic_message(&panic)
                );
                if !matches!(kind, OpKind::Abandon | OpKind::Unbind) {
                    let mut res = new_response(RESULT_OPERATIONS_ERROR);
                    res.set_diagnostic_message("handler failed");
                    let _ = w.write(res).await;
                }
            }
            registry.unregister(message_id);
        });
    }

    /// Perform the StartTLS exchange inline on the read-loop task. The
    /// success response is queued ahead of the writer handoff, so it and
    /// everything queued before it still go out over cleartext.
    async fn start_tls(
        &mut self,
        rd: ReadHalf<ClientStream>,
        message_id: i32,
    ) -> Result<ReadHalf<ClientStream>> {
        let w = ResponseWriter::new(self.tx.clone(), message_id, OpKind::Extended);

        if self.tls_active {
            let mut res = new_extended_response(RESULT_OPERATIONS_ERROR);
            res.set_diagnostic_message("TLS already established");
            let _ = w.write(res).await;
            return Ok(rd);
        }
        let Some(tls_config) = self.shared.tls.clone() else {
            let mut res = new_extended_response(RESULT_UNWILLING_TO_PERFORM);
            res.set_diagnostic_message("StartTLS is not configured on this server");
            let _ = w.write(res).await;
            return Ok(rd);
        };

        let mut res = new_extended_response(RESULT_SUCCESS);
        res.set_response_name(OID_START_TLS);
        w.write(res).await.context("queue StartTLS response")?;

        // Reclaim the write half once the serializer has flushed the queue.
        let (reply_tx, reply_rx) = oneshot::channel();
        let (new_writer_tx, new_writer_rx) = oneshot::channel();
        self.tx
            .send(Outbound::SwapWriter { reply: reply_tx, new_writer: new_writer_rx })
            .await
            .map_err(|_| anyhow!("serializer exited before StartTLS handoff"))?;
        let wr = reply_rx
            .await
            .context("serializer exited during StartTLS handoff")?;

        let tcp = match rd.unsplit(wr) {
            ClientStream::Tcp(tcp) => tcp,
            ClientStream::Tls(_) => return Err(anyhow!("StartTLS over TLS stream")),
        };

        let acceptor = TlsAcceptor::from(tls_config);
        match acceptor.accept(tcp).into_fallible().await {
            Ok(tls_stream) => {
                debug!(client = self.id, "StartTLS handshake complete");
                let (new_rd, new_wr) = tokio::io::split(ClientStream::Tls(tls_stream));
                new_writer_tx
                    .send(new_wr)
                    .map_err(|_| anyhow!("serializer exited after StartTLS handshake"))?;
                self.tls_active = true;
                Ok(new_rd)
            }
            Err((e, tcp)) => {
                // Second response goes out over the recovered cleartext
                // stream; the connection is then torn down.
                let (_new_rd, new_wr) = tokio::io::split(ClientStream::Tcp(tcp));
                if new_writer_tx.send(new_wr).is_ok() {
                    let mut res = new_extended_response(RESULT_OPERATIONS_ERROR);
                    res.set_diagnostic_message("TLS handshake failed");
                    let _ = w.write(res).await;
                }
                Err(anyhow!(e).context("TLS handshake"))
            }
        }
    }

    /// Single teardown path. Joins the shutdown listener before returning
    /// and signals every in-flight operation outside the registry lock.
    async fn close(self, serializer: JoinHandle<()>, shutdown_listener: JoinHandle<()>) {
        debug!(client = self.id, "connection teardown");
        self.registry.set_closing();
        self.conn_token.cancel();
        let _ = shutdown_listener.await;
        self.registry.abort_all();
        self.workers.close();
        self.workers.wait().await;
        drop(self.tx);
        let _ = serializer.await;
        debug!(client = self.id, in_flight = self.registry.len(), "connection closed");
    }
}

async fn run_serializer(
    conn_id: u64,
    mut rx: mpsc::Receiver<Outbound>,
    mut wr: WriteHalf<ClientStream>,
    write_timeout: Option<Duration>,
    conn_token: CancellationToken,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Message(msg) => {
                let data = match proto::encode_ldap_message(&msg) {
                    Ok(d) => d,
                    Err(e) => {
                        error!(client = conn_id, "failed to encode response: {:#}", e);
                        continue;
                    }
                };
                let deadline = if conn_token.is_cancelled() {
                    Some(SHUTDOWN_FLUSH_TIMEOUT)
                } else {
                    write_timeout
                };
                if let Err(e) = write_with_deadline(&mut wr, &data, deadline).await {
                    warn!(client = conn_id, "write error: {}", e);
                    conn_token.cancel();
                    break;
                }
            }
            Outbound::SwapWriter { reply, new_writer } => {
                let _ = wr.flush().await;
                if reply.send(wr).is_err() {
                    // Engine gone; it owns the stream now.
                    return;
                }
                match new_writer.await {
                    Ok(w2) => wr = w2,
                    Err(_) => {
                        conn_token.cancel();
                        return;
                    }
                }
            }
        }
    }
    let _ = wr.shutdown().await;
}

async fn write_with_deadline(
    wr: &mut WriteHalf<ClientStream>,
    data: &[u8],
    deadline: Option<Duration>,
) -> std::io::Result<()> {
    let write = async {
        wr.write_all(data).await?;
        wr.flush().await
    };
    match deadline {
        Some(d) => timeout(d, write)
            .await
            .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into())),
        None => write.await,
    }
}

/// Waits for the server-wide stop signal; on stop, queues the unsolicited
/// Notice of Disconnection and nudges the read loop off its socket read.
async fn run_shutdown_listener(
    stop: CancellationToken,
    conn_token: CancellationToken,
    tx: mpsc::Sender<Outbound>,
) {
    tokio::select! {
        _ = conn_token.cancelled() => {}
        _ = stop.cancelled() => {
            let notice = notice_of_disconnection();
            tokio::select! {
                _ = tx.send(Outbound::Message(notice)) => {}
                _ = conn_token.cancelled() => {}
            }
            conn_token.cancel();
        }
    }
}

/// Unsolicited ExtendedResponse on message id 0 announcing server shutdown.
fn notice_of_disconnection() -> LdapMessage {
    let mut res = new_extended_response(RESULT_UNWILLING_TO_PERFORM);
    res.set_response_name(OID_NOTICE_OF_DISCONNECTION);
    res.set_diagnostic_message("server is shutting down");
    LdapMessage {
        message_id: 0,
        protocol_op: ProtocolOp::ExtendedResponse(res),
        controls: None,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
