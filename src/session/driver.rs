//! Tokio driver for a [`Session`]: connects, pumps bytes both ways, runs the
//! keep-alive timer and carries out socket work for file transfers.
//!
//! A session runs on its own task. Collaborators talk to it through a
//! [`SessionHandle`] and receive [`GatewayEvent`]s from an [`EventStream`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::dns::{parse_server_input, resolve_server, ParsedServer, ServerEndpoint};
use super::transport::{connect_endpoint, Transport};
use super::{Session, SessionAction, SessionCore, SessionState};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult, TransferError, TransferResult};
use crate::events::GatewayEvent;
use crate::transfer::io::{accept_streamhost, connect_candidates, pump};
use crate::transfer::{Candidate, TransferAction, TransferId, TransferUpdate};
use crate::xmltree::{Element, HandlerStatus};

/// Bytes read from the server per wake-up.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long a closing session may spend flushing its goodbye.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// `see-other-host` redirects followed before giving up.
const MAX_REDIRECTS: usize = 5;

pub type DataSource = Box<dyn AsyncRead + Send + Unpin>;
pub type DataSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Events of one session, ending when the session task exits.
pub type EventStream = BoxStream<'static, GatewayEvent>;

/// Requests from collaborators to the session task.
pub enum SessionCommand {
    SendTracked {
        stanza: Element,
        reply: oneshot::Sender<SessionResult<Element>>,
    },
    SendUntracked {
        stanza: Element,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    OfferTransfer {
        to: String,
        name: String,
        size: u64,
        source: DataSource,
        reply: oneshot::Sender<SessionResult<TransferId>>,
    },
    AcceptTransfer {
        id: TransferId,
        sink: DataSink,
        reply: oneshot::Sender<TransferResult<()>>,
    },
    CancelTransfer {
        id: TransferId,
        reason: String,
        reply: oneshot::Sender<TransferResult<()>>,
    },
    Close,
}

/// Cheap, cloneable access to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    fn submit(&self, command: SessionCommand) -> SessionResult<()> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    /// Send an IQ request and wait for its reply (result or error).
    /// Fails with `NotReady` before login completes.
    pub async fn request(&self, stanza: Element) -> SessionResult<Element> {
        let (reply, rx) = oneshot::channel();
        self.submit(SessionCommand::SendTracked { stanza, reply })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Queue a stanza without waiting for any reply.
    pub async fn send(&self, stanza: Element) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(SessionCommand::SendUntracked { stanza, reply })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Offer `size` bytes read from `source` to the full JID `to`.
    pub async fn offer_file(
        &self,
        to: &str,
        name: &str,
        size: u64,
        source: DataSource,
    ) -> SessionResult<TransferId> {
        let (reply, rx) = oneshot::channel();
        self.submit(SessionCommand::OfferTransfer {
            to: to.to_string(),
            name: name.to_string(),
            size,
            source,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Accept an offered file, writing it to `sink`.
    pub async fn accept_file(&self, id: TransferId, sink: DataSink) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(SessionCommand::AcceptTransfer { id, sink, reply })?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub async fn cancel_file(&self, id: TransferId, reason: &str) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(SessionCommand::CancelTransfer {
            id,
            reason: reason.to_string(),
            reply,
        })?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Log out. Safe to call on a session that already ended.
    pub fn close(&self) {
        let _ = self.submit(SessionCommand::Close);
    }
}

/// Validate `config` and start the session on a new task.
pub fn start_session(config: SessionConfig) -> SessionResult<(SessionHandle, EventStream)> {
    let session = Session::new(config)?;
    // Before any TLS operation
    super::transport::init_crypto_provider();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(session, command_rx, event_tx));

    let events = stream::unfold(event_rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .boxed();
    Ok((
        SessionHandle {
            commands: command_tx,
        },
        events,
    ))
}

enum Outcome {
    Redirect { host: String, port: u16 },
    Finished,
}

async fn run(
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<GatewayEvent>,
) {
    let mut io = TransferIo::new(session.config());
    let mut redirect: Option<ServerEndpoint> = None;
    let mut redirects = 0;

    loop {
        session.on_connecting();
        let endpoints = match redirect.take() {
            Some(endpoint) => Ok(vec![endpoint]),
            None => resolve_endpoints(session.config()).await,
        };
        let connected = match endpoints {
            Ok(endpoints) => connect_any(&endpoints, session.config().tls_verify).await,
            Err(e) => Err(e),
        };
        let (transport, endpoint) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                session.on_transport_error(&e);
                break;
            }
        };

        io.local_ip = transport.local_ip();
        if transport.is_tls() {
            session.on_direct_tls();
        }
        session.on_connected();

        match drive(&mut session, transport, &endpoint, &mut commands, &events, &mut io).await {
            Outcome::Finished => break,
            Outcome::Redirect { host, port } => {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    session.on_transport_error(&SessionError::fatal("too many redirects", true));
                    break;
                }
                let mut target = match parse_server_input(&format!("{}:{}", host, port)) {
                    ParsedServer::Direct(endpoint) => endpoint,
                    ParsedServer::Domain(host) => {
                        ServerEndpoint::new(&host, port, super::dns::ConnectionMode::Tcp)
                    }
                };
                target.domain = Some(session.jid().domain().to_string());
                session.restart_for_redirect();
                redirect = Some(target);
            }
        }
    }

    io.release_all();
    forward_events(&mut session, &events);
    debug!(jid = %session.jid(), "session task finished");
}

async fn resolve_endpoints(config: &SessionConfig) -> SessionResult<Vec<ServerEndpoint>> {
    match parse_server_input(&config.server_input()?) {
        ParsedServer::Direct(endpoint) => Ok(vec![endpoint]),
        ParsedServer::Domain(domain) => resolve_server(&domain).await,
    }
}

/// Try each endpoint in order; the last error wins.
async fn connect_any(
    endpoints: &[ServerEndpoint],
    verify: bool,
) -> SessionResult<(Transport, ServerEndpoint)> {
    let mut last_error = SessionError::dns("no server endpoints");
    for endpoint in endpoints {
        match connect_endpoint(endpoint, verify).await {
            Ok(transport) => return Ok((transport, endpoint.clone())),
            Err(e) => {
                warn!(host = %endpoint.host, port = endpoint.port, error = %e, "endpoint failed, trying next");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

fn forward_events(session: &mut Session, events: &mpsc::UnboundedSender<GatewayEvent>) {
    while let Some(event) = session.poll_event() {
        let _ = events.send(event);
    }
}

/// Write everything the session queued. False once the transport failed.
async fn flush(session: &mut Session, transport: &mut Transport) -> bool {
    let output = session.take_output();
    if output.is_empty() {
        return true;
    }
    let written = async {
        transport.write_all(&output).await?;
        transport.flush().await
    };
    match written.await {
        Ok(()) => true,
        Err(e) => {
            session.on_transport_error(&SessionError::Io(e));
            false
        }
    }
}

/// Upgrade after `<proceed/>`. Plaintext still queued goes out before the
/// handshake starts.
async fn secure(session: &mut Session, transport: &mut Transport, endpoint: &ServerEndpoint) {
    if !flush(session, transport).await {
        return;
    }
    let verify = session.config().tls_verify;
    match transport.starttls(endpoint.tls_name(), verify).await {
        Ok(()) => session.on_transport_secured(),
        Err(e) => session.on_transport_error(&e),
    }
}

/// Best-effort goodbye, bounded in time.
async fn shutdown(session: &mut Session, transport: &mut Transport) {
    let output = session.take_output();
    let closing = async {
        if !output.is_empty() {
            transport.write_all(&output).await?;
        }
        transport.shutdown().await
    };
    match timeout(CLOSE_FLUSH_TIMEOUT, closing).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "error while closing the transport"),
        Err(_) => debug!("closing the transport timed out"),
    }
}

async fn drive(
    session: &mut Session,
    mut transport: Transport,
    endpoint: &ServerEndpoint,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    events: &mpsc::UnboundedSender<GatewayEvent>,
    io: &mut TransferIo,
) -> Outcome {
    let period = session.config().keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut commands_open = true;
    let mut eof = false;

    loop {
        while let Some(action) = session.poll_action() {
            match action {
                SessionAction::StartTls => secure(session, &mut transport, endpoint).await,
                SessionAction::Redirect { host, port } => {
                    forward_events(session, events);
                    let _ = timeout(CLOSE_FLUSH_TIMEOUT, transport.shutdown()).await;
                    return Outcome::Redirect { host, port };
                }
                SessionAction::Disconnect => {
                    shutdown(session, &mut transport).await;
                    forward_events(session, events);
                    return Outcome::Finished;
                }
                SessionAction::Transfer(action) => io.handle(action).await,
            }
        }

        flush(session, &mut transport).await;
        if session.has_pending_output() || session.has_pending_actions() {
            continue;
        }
        forward_events(session, events);
        if eof {
            return Outcome::Finished;
        }

        tokio::select! {
            read = transport.read(&mut buf) => match read {
                Ok(0) => {
                    eof = true;
                    session.on_transport_closed();
                }
                Ok(n) => session.on_bytes(&buf[..n]),
                Err(e) => session.on_transport_error(&SessionError::Io(e)),
            },
            _ = keepalive.tick() => session.on_tick(std::time::Instant::now()),
            command = commands.recv(), if commands_open => match command {
                Some(command) => io.on_command(session, command),
                None => {
                    // Every handle is gone
                    commands_open = false;
                    session.close();
                }
            },
            Some(update) = io.updates.recv() => session.on_transfer_update(update),
        }
    }
}

/// What the sending task does once the peer picked a streamhost.
enum SendPlan {
    /// The peer is on our listener
    Direct,
    /// Connect to a proxy, then wait for activation
    Proxy {
        candidate: Candidate,
        digest: String,
        activated: oneshot::Receiver<()>,
    },
}

/// Sockets, data endpoints and tasks held for the session's transfers.
struct TransferIo {
    connect_timeout: Duration,
    listen_timeout: Duration,
    advertise_host: Option<String>,
    local_ip: Option<IpAddr>,
    sources: HashMap<TransferId, (DataSource, u64)>,
    sinks: HashMap<TransferId, DataSink>,
    plans: HashMap<TransferId, oneshot::Sender<SendPlan>>,
    activations: HashMap<TransferId, oneshot::Sender<()>>,
    tasks: HashMap<TransferId, AbortHandle>,
    updates_tx: mpsc::UnboundedSender<TransferUpdate>,
    updates: mpsc::UnboundedReceiver<TransferUpdate>,
}

impl TransferIo {
    fn new(config: &SessionConfig) -> Self {
        let (updates_tx, updates) = mpsc::unbounded_channel();
        Self {
            connect_timeout: config.transfer_connect_timeout(),
            listen_timeout: config.transfer_listen_timeout(),
            advertise_host: config.transfer_host.clone(),
            local_ip: None,
            sources: HashMap::new(),
            sinks: HashMap::new(),
            plans: HashMap::new(),
            activations: HashMap::new(),
            tasks: HashMap::new(),
            updates_tx,
            updates,
        }
    }

    fn on_command(&mut self, session: &mut Session, command: SessionCommand) {
        match command {
            SessionCommand::SendTracked { stanza, reply } => {
                if session.state() != SessionState::Ready {
                    let _ = reply.send(Err(SessionError::NotReady));
                    return;
                }
                let sent = session.send_tracked(
                    stanza,
                    Box::new(move |_core: &mut SessionCore, response: &Element, _request: &Element| {
                        let _ = reply.send(Ok(response.clone()));
                        HandlerStatus::Handled
                    }),
                );
                if let Err(e) = sent {
                    warn!(error = %e, "request refused");
                }
            }
            SessionCommand::SendUntracked { stanza, reply } => {
                let _ = reply.send(session.send_untracked(stanza));
            }
            SessionCommand::OfferTransfer {
                to,
                name,
                size,
                source,
                reply,
            } => {
                let result = session.offer_transfer(&to, &name, size);
                if let Ok(id) = &result {
                    self.sources.insert(*id, (source, size));
                }
                let _ = reply.send(result);
            }
            SessionCommand::AcceptTransfer { id, sink, reply } => {
                let result = session.accept_transfer(id);
                if result.is_ok() {
                    self.sinks.insert(id, sink);
                }
                let _ = reply.send(result);
            }
            SessionCommand::CancelTransfer { id, reason, reply } => {
                let _ = reply.send(session.cancel_transfer(id, &reason));
            }
            SessionCommand::Close => session.close(),
        }
    }

    async fn handle(&mut self, action: TransferAction) {
        match action {
            TransferAction::Listen { id, digest } => {
                let listener = match TcpListener::bind("0.0.0.0:0").await {
                    Ok(listener) => listener,
                    Err(e) => {
                        self.report(TransferUpdate::Failed {
                            id,
                            reason: format!("could not open local streamhost: {}", e),
                        });
                        self.spawn_sender(id, None, String::new());
                        return;
                    }
                };
                let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
                let host = self
                    .advertise_host
                    .clone()
                    .or_else(|| self.local_ip.map(|ip| ip.to_string()))
                    .unwrap_or_else(|| "127.0.0.1".to_string());
                info!(transfer = %id, host = %host, port, "local streamhost listening");
                self.report(TransferUpdate::Listening { id, host, port });
                self.spawn_sender(id, Some(listener), digest);
            }
            TransferAction::SendDirect { id } => self.plan(id, SendPlan::Direct),
            TransferAction::ConnectProxy {
                id,
                candidate,
                digest,
            } => {
                if !self.plans.contains_key(&id) {
                    self.spawn_sender(id, None, String::new());
                }
                let (go, activated) = oneshot::channel();
                self.activations.insert(id, go);
                self.plan(
                    id,
                    SendPlan::Proxy {
                        candidate,
                        digest,
                        activated,
                    },
                );
            }
            TransferAction::StartSending { id } => {
                if let Some(go) = self.activations.remove(&id) {
                    let _ = go.send(());
                }
            }
            TransferAction::Receive {
                id,
                candidates,
                digest,
                size,
            } => {
                let Some(mut sink) = self.sinks.remove(&id) else {
                    self.report(TransferUpdate::Failed {
                        id,
                        reason: "no destination for received data".to_string(),
                    });
                    return;
                };
                let updates = self.updates_tx.clone();
                let connect_timeout = self.connect_timeout;
                let task = tokio::spawn(async move {
                    let result =
                        receive(id, &candidates, &digest, size, &mut sink, connect_timeout, &updates)
                            .await;
                    let _ = updates.send(finished(id, result));
                });
                self.tasks.insert(id, task.abort_handle());
            }
            TransferAction::Release { id } => self.release(id),
        }
    }

    fn report(&self, update: TransferUpdate) {
        let _ = self.updates_tx.send(update);
    }

    fn plan(&mut self, id: TransferId, plan: SendPlan) {
        match self.plans.remove(&id) {
            Some(tx) => {
                let _ = tx.send(plan);
            }
            None => warn!(transfer = %id, "no sending task waiting for a plan"),
        }
    }

    fn spawn_sender(&mut self, id: TransferId, listener: Option<TcpListener>, digest: String) {
        let Some((mut source, size)) = self.sources.remove(&id) else {
            self.report(TransferUpdate::Failed {
                id,
                reason: "no data source for the transfer".to_string(),
            });
            return;
        };
        let (plan_tx, plan_rx) = oneshot::channel();
        self.plans.insert(id, plan_tx);
        let updates = self.updates_tx.clone();
        let timeouts = (self.listen_timeout, self.connect_timeout);
        let task = tokio::spawn(async move {
            let result = send(id, listener, &digest, plan_rx, &mut source, size, timeouts, &updates).await;
            let _ = updates.send(finished(id, result));
        });
        self.tasks.insert(id, task.abort_handle());
    }

    fn release(&mut self, id: TransferId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
        self.sources.remove(&id);
        self.sinks.remove(&id);
        self.plans.remove(&id);
        self.activations.remove(&id);
    }

    fn release_all(&mut self) {
        let ids: Vec<TransferId> = self
            .tasks
            .keys()
            .chain(self.sources.keys())
            .chain(self.sinks.keys())
            .copied()
            .collect();
        for id in ids {
            self.release(id);
        }
    }
}

/// Receiving side: first working streamhost, then the data into `sink`.
async fn receive(
    id: TransferId,
    candidates: &[Candidate],
    digest: &str,
    size: u64,
    sink: &mut DataSink,
    connect_timeout: Duration,
    updates: &mpsc::UnboundedSender<TransferUpdate>,
) -> TransferResult<u64> {
    let mut established = connect_candidates(candidates, digest, connect_timeout).await?;
    let _ = updates.send(TransferUpdate::Connected {
        id,
        candidate: established.index,
    });
    let leftover = std::mem::take(&mut established.leftover);
    pump(&mut established.stream, sink, size, leftover, |transferred| {
        let _ = updates.send(TransferUpdate::Progress { id, transferred });
    })
    .await
}

/// Sending side: wait on the local listener and the peer's choice, then
/// write `source` to whichever stream won.
#[allow(clippy::too_many_arguments)]
async fn send(
    id: TransferId,
    listener: Option<TcpListener>,
    digest: &str,
    plan_rx: oneshot::Receiver<SendPlan>,
    source: &mut DataSource,
    size: u64,
    (listen_timeout, connect_timeout): (Duration, Duration),
    updates: &mpsc::UnboundedSender<TransferUpdate>,
) -> TransferResult<u64> {
    let accept = async {
        match listener {
            Some(listener) => accept_streamhost(listener, digest, listen_timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(accept);
    let mut plan_rx = plan_rx;
    let mut accepted = None;
    let mut accept_done = false;
    let plan = tokio::select! {
        res = &mut accept => {
            accept_done = true;
            match res {
                Ok((stream, _)) => accepted = Some(stream),
                Err(e) => debug!(transfer = %id, error = %e, "local streamhost gave up"),
            }
            plan_rx.await
        }
        plan = &mut plan_rx => plan,
    };
    let plan = plan.map_err(|_| TransferError::Hangup("negotiation"))?;

    let mut stream = match plan {
        SendPlan::Direct => match accepted {
            Some(stream) => stream,
            None if accept_done => {
                return Err(TransferError::Exhausted(
                    "peer never connected to the local streamhost".to_string(),
                ))
            }
            None => accept.await?.0,
        },
        SendPlan::Proxy {
            candidate,
            digest,
            activated,
        } => {
            drop(accepted);
            let established = connect_candidates(&[candidate], &digest, connect_timeout).await?;
            let _ = updates.send(TransferUpdate::Connected {
                id,
                candidate: established.index,
            });
            activated
                .await
                .map_err(|_| TransferError::Hangup("proxy activation"))?;
            established.stream
        }
    };
    let sent = pump(source, &mut stream, size, Vec::new(), |transferred| {
        let _ = updates.send(TransferUpdate::Progress { id, transferred });
    })
    .await?;
    let _ = stream.shutdown().await;
    Ok(sent)
}

fn finished(id: TransferId, result: TransferResult<u64>) -> TransferUpdate {
    match result {
        Ok(transferred) => TransferUpdate::Completed { id, transferred },
        Err(e) => {
            error!(transfer = %id, error = %e, "transfer failed");
            TransferUpdate::Failed {
                id,
                reason: e.to_string(),
            }
        }
    }
}
