//! Session state machine: stream negotiation, authentication, resource
//! binding and the collaborator-facing API.
//!
//! [`Session`] does no I/O. The driver feeds it transport events, writes out
//! whatever it queued with [`Session::take_output`], and carries out the
//! [`SessionAction`]s it asks for. Stanza handlers run synchronously inside
//! [`Session::on_bytes`].

pub mod auth;
pub mod dns;
pub mod driver;
mod handlers;
pub mod transport;

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use tracing::{debug, error, info, trace};

use crate::cache::{CorrelationCache, Resolver};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult, TransferResult};
use crate::events::GatewayEvent;
use crate::jid::Jid;
use crate::stanza;
use crate::transfer::{TransferAction, TransferEngine, TransferId, TransferUpdate};
use crate::xmltree::{Dispatch, Element, HandlerStatus, StreamParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    StreamOpened,
    SecuringTransport,
    Authenticating,
    BindingResource,
    EstablishingSession,
    Ready,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::StreamOpened => "stream-opened",
            Self::SecuringTransport => "securing-transport",
            Self::Authenticating => "authenticating",
            Self::BindingResource => "binding-resource",
            Self::EstablishingSession => "establishing-session",
            Self::Ready => "ready",
            Self::Closing => "closing",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub tls_done: bool,
    pub wants_bind: bool,
    pub wants_session: bool,
    pub authenticated: bool,
}

/// Transport-level work the driver must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Flush, then wrap the socket in TLS and call
    /// [`Session::on_transport_secured`]
    StartTls,
    /// Drop the connection and start over against another server
    Redirect { host: String, port: u16 },
    /// Flush what is queued (best effort) and close the transport
    Disconnect,
    Transfer(TransferAction),
}

/// Everything the stanza handlers act on. Owned by [`Session`] next to the
/// parser so handlers can borrow it mutably while the parser walks its tree.
pub struct SessionCore {
    pub(crate) config: SessionConfig,
    pub(crate) jid: Jid,
    state: SessionState,
    flags: SessionFlags,
    stream_started: bool,
    auth_started: bool,
    stream_id: Option<String>,
    pub(crate) cache: CorrelationCache<SessionCore>,
    pub(crate) transfers: TransferEngine,
    /// The single write queue for the transport
    outbox: Vec<u8>,
    actions: VecDeque<SessionAction>,
    events: VecDeque<GatewayEvent>,
    restart_pending: bool,
    redirecting: bool,
    failed: bool,
}

impl SessionCore {
    fn new(config: SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        let jid = config.parsed_jid()?;
        let transfers = TransferEngine::new(config.proxy_settings()?);
        Ok(Self {
            config,
            jid,
            state: SessionState::Disconnected,
            flags: SessionFlags::default(),
            stream_started: false,
            auth_started: false,
            stream_id: None,
            cache: CorrelationCache::new(),
            transfers,
            outbox: Vec::new(),
            actions: VecDeque::new(),
            events: VecDeque::new(),
            restart_pending: false,
            redirecting: false,
            failed: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Full JID in use; the server may replace the resource when binding.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub(crate) fn transition(&mut self, to: SessionState) {
        if self.state != to {
            debug!(from = %self.state, to = %to, "session state change");
            self.state = to;
        }
    }

    pub(crate) fn write_raw(&mut self, data: &str) {
        trace!(direction = "out", data, "xmpp");
        self.outbox.extend_from_slice(data.as_bytes());
    }

    pub(crate) fn write_element(&mut self, element: &Element) {
        self.write_raw(&element.to_xml());
    }

    /// Stamp `request` with a tracked id, remember `resolver` and queue it.
    pub(crate) fn send_tracked(&mut self, request: Element, resolver: Resolver<SessionCore>) -> String {
        let stamped = self.cache.track(request, resolver, Instant::now());
        self.write_element(&stamped);
        stamped.attr("id").unwrap_or_default().to_string()
    }

    /// Queue a stanza nobody waits a reply for. IQs without an id get an
    /// untracked one.
    pub(crate) fn send_untracked(&mut self, mut stanza: Element) {
        if stanza.name() == "iq" && stanza.attr("id").is_none() {
            let id = self.cache.untracked_id();
            stanza.set_attr("id", id);
        }
        self.write_element(&stanza);
    }

    pub(crate) fn push_action(&mut self, action: SessionAction) {
        self.actions.push_back(action);
    }

    pub(crate) fn emit(&mut self, event: GatewayEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn log(&mut self, text: impl Into<String>) {
        let text = text.into();
        info!(jid = %self.jid.bare(), "{}", text);
        self.emit(GatewayEvent::Log(text));
    }

    fn send_stream_open(&mut self) {
        let open = stanza::stream_open(self.jid.domain());
        self.write_raw(&open);
    }

    /// End the session with a fatal error. Reported once; later calls only
    /// keep aborting the dispatch walk.
    pub(crate) fn fail(&mut self, message: impl Into<String>, retryable: bool) -> HandlerStatus {
        if self.failed {
            return HandlerStatus::Abort;
        }
        self.failed = true;
        let message = message.into();
        error!(jid = %self.jid.bare(), state = %self.state, retryable, error = %message, "session failed");
        self.emit(GatewayEvent::FatalError { message, retryable });
        self.teardown("session failed");
        self.transition(SessionState::Disconnected);
        self.push_action(SessionAction::Disconnect);
        HandlerStatus::Abort
    }

    /// Cancel pending requests and every transfer.
    fn teardown(&mut self, reason: &str) {
        self.cache.clear();
        self.cancel_all_transfers(reason);
    }

    /// Record the remote's stream header, once per stream.
    fn on_stream_start(&mut self, name: &str, id: Option<&str>, version: Option<&str>) -> HandlerStatus {
        self.stream_started = true;
        if name != stanza::STREAM_ROOT {
            return self.fail(format!("unexpected root element <{}>", name), true);
        }
        self.stream_id = id.map(str::to_string);
        debug!(stream_id = ?self.stream_id, version = ?version, "stream started");
        if version.is_none() {
            // Pre-1.0 server: no feature list will follow
            if self.config.tls == crate::config::TlsPolicy::Required && !self.flags.tls_done {
                return self.fail("server does not support TLS, but it is required", false);
            }
            if !self.flags.authenticated && !self.auth_started {
                self.begin_legacy_auth();
            }
        }
        HandlerStatus::Handled
    }

    pub(crate) fn become_ready(&mut self) {
        self.transition(SessionState::Ready);
        self.log("Logged in");
        let jid = self.jid.clone();
        self.emit(GatewayEvent::Ready { jid });
        self.start_proxy_discovery();
    }
}

/// One user session: the stream parser plus the state it drives.
pub struct Session {
    parser: StreamParser<SessionCore>,
    core: SessionCore,
}

impl Session {
    pub fn new(config: SessionConfig) -> SessionResult<Self> {
        Ok(Self {
            parser: StreamParser::new(handlers::table()),
            core: SessionCore::new(config)?,
        })
    }

    pub fn state(&self) -> SessionState {
        self.core.state
    }

    pub fn flags(&self) -> SessionFlags {
        self.core.flags
    }

    pub fn jid(&self) -> &Jid {
        &self.core.jid
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    /// Number of times the stream parser restarted on this session.
    pub fn parser_resets(&self) -> u64 {
        self.parser.reset_count()
    }

    /// Outstanding tracked requests.
    pub fn pending_requests(&self) -> usize {
        self.core.cache.len()
    }

    pub fn on_connecting(&mut self) {
        self.core.transition(SessionState::Connecting);
    }

    /// The endpoint speaks TLS from the first byte.
    pub fn on_direct_tls(&mut self) {
        self.core.flags.tls_done = true;
    }

    /// Transport is up: open the stream.
    pub fn on_connected(&mut self) {
        self.core.send_stream_open();
        self.core.transition(SessionState::StreamOpened);
    }

    /// Bytes from the server.
    pub fn on_bytes(&mut self, bytes: &[u8]) {
        if self.core.failed || self.core.redirecting {
            return;
        }
        trace!(direction = "in", data = %String::from_utf8_lossy(bytes), "xmpp");
        if let Err(e) = self.parser.feed(bytes) {
            self.core.fail(format!("XML stream error: {}", e), true);
            return;
        }

        if !self.core.stream_started {
            let header = self.parser.root().map(|root| {
                (
                    root.name().to_string(),
                    root.attr("id").map(str::to_string),
                    root.attr("version").map(str::to_string),
                )
            });
            if let Some((name, id, version)) = header {
                let status = self
                    .core
                    .on_stream_start(&name, id.as_deref(), version.as_deref());
                if status == HandlerStatus::Abort {
                    return;
                }
            }
        }

        if self.parser.dispatch(&mut self.core) == Dispatch::Aborted {
            return;
        }
        self.parser.cleanup();

        if self.core.restart_pending {
            self.core.restart_pending = false;
            self.restart_stream();
        }
    }

    /// Same transport, fresh stream (after SASL success or STARTTLS).
    fn restart_stream(&mut self) {
        self.parser.reset();
        self.core.stream_started = false;
        self.core.stream_id = None;
        self.core.send_stream_open();
    }

    /// The transport was swapped for a TLS one.
    pub fn on_transport_secured(&mut self) {
        self.core.flags.tls_done = true;
        self.restart_stream();
        self.core.transition(SessionState::StreamOpened);
    }

    pub fn on_transport_closed(&mut self) {
        match self.core.state {
            SessionState::Closing | SessionState::Disconnected => {}
            _ => {
                self.core.fail("Connection closed by server", true);
            }
        }
    }

    pub fn on_transport_error(&mut self, error: &SessionError) {
        match self.core.state {
            SessionState::Closing | SessionState::Disconnected => {
                debug!(error = %error, "transport error after close");
            }
            _ => {
                self.core.fail(error.to_string(), error.retryable());
            }
        }
    }

    /// Keep-alive tick: a bare newline once Ready, and a cache sweep that
    /// also ends transfers stuck on an unanswered request.
    pub fn on_tick(&mut self, now: Instant) {
        if self.core.state == SessionState::Ready {
            self.core.write_raw("\n");
        }
        let max_age = self.core.config.cache_max_age();
        let expired = self.core.cache.sweep(now, max_age);
        if !expired.is_empty() {
            self.core.expire_transfer_requests(&expired);
        }
    }

    /// Forget the current connection after a redirect so the driver can
    /// connect elsewhere.
    pub fn restart_for_redirect(&mut self) {
        self.parser.reset();
        self.core.redirecting = false;
        self.core.stream_started = false;
        self.core.auth_started = false;
        self.core.stream_id = None;
        self.core.flags = SessionFlags::default();
        self.core.cache.clear();
        self.core.outbox.clear();
        self.core.transition(SessionState::Connecting);
    }

    /// Leave: a best-effort goodbye when nothing else is queued, then
    /// cancel everything this session owns.
    pub fn close(&mut self) {
        if matches!(
            self.core.state,
            SessionState::Closing | SessionState::Disconnected
        ) {
            return;
        }
        let stream_open = self.core.state != SessionState::Connecting;
        if stream_open && self.core.outbox.is_empty() {
            let presence = Element::new("presence").with_attr("type", "unavailable");
            self.core.write_element(&presence);
            self.core.write_raw(stanza::STREAM_CLOSE);
        }
        self.core.transition(SessionState::Closing);
        self.core.teardown("session closed");
        self.core.push_action(SessionAction::Disconnect);
    }

    /// Send a request and run `resolver` with its reply. Returns the id the
    /// request was stamped with.
    ///
    /// Collaborator traffic is only accepted once the session is Ready.
    pub fn send_tracked(
        &mut self,
        request: Element,
        resolver: Resolver<SessionCore>,
    ) -> SessionResult<String> {
        self.ensure_ready()?;
        Ok(self.core.send_tracked(request, resolver))
    }

    pub fn send_untracked(&mut self, stanza: Element) -> SessionResult<()> {
        self.ensure_ready()?;
        self.core.send_untracked(stanza);
        Ok(())
    }

    fn ensure_ready(&self) -> SessionResult<()> {
        if self.core.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        Ok(())
    }

    /// Offer `name` (`size` bytes) to the full JID `to`.
    pub fn offer_transfer(&mut self, to: &str, name: &str, size: u64) -> SessionResult<TransferId> {
        self.ensure_ready()?;
        Ok(self.core.offer_transfer(to, name, size))
    }

    pub fn accept_transfer(&mut self, id: TransferId) -> TransferResult<()> {
        self.core.accept_transfer(id)
    }

    pub fn cancel_transfer(&mut self, id: TransferId, reason: &str) -> TransferResult<()> {
        self.core.cancel_transfer(id, reason)
    }

    pub fn on_transfer_update(&mut self, update: TransferUpdate) {
        self.core.on_transfer_update(update);
    }

    /// Bytes queued for the transport, in order.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.core.outbox)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.core.outbox.is_empty()
    }

    pub fn has_pending_actions(&self) -> bool {
        !self.core.actions.is_empty()
    }

    pub fn poll_action(&mut self) -> Option<SessionAction> {
        self.core.actions.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<GatewayEvent> {
        self.core.events.pop_front()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::TlsPolicy;
    use crate::xmltree::{HandlerEntry, NamePattern, ParentPattern};

    pub(crate) const SERVER_OPEN: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
        id='s1' from='example.org' version='1.0'>";

    pub(crate) const FEATURES_PLAIN: &str = "<stream:features>\
        <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
        </stream:features>";

    pub(crate) const FEATURES_BIND: &str = "<stream:features>\
        <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
        <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>\
        </stream:features>";

    /// Top-level stanzas found in a chunk of our own output.
    pub(crate) fn sent_stanzas(output: &[u8]) -> Vec<Element> {
        fn collect(node: crate::xmltree::NodeRef<'_>, out: &mut Vec<Element>) -> HandlerStatus {
            out.push(node.to_element());
            HandlerStatus::Handled
        }
        let mut parser = StreamParser::new(vec![HandlerEntry::new(
            NamePattern::Any,
            ParentPattern::Exact("stream:stream"),
            collect,
        )]);
        let text = String::from_utf8_lossy(output);
        let body = match text.find("<stream:stream") {
            Some(pos) => text[pos..].split_once('>').map(|(_, rest)| rest).unwrap_or(""),
            None => &text,
        };
        let wrapped = format!("<stream:stream>{}", body.replace("</stream:stream>", ""));
        parser.feed(wrapped.as_bytes()).unwrap();
        let mut out = Vec::new();
        parser.dispatch(&mut out);
        out
    }

    pub(crate) fn config(jid: &str) -> SessionConfig {
        let mut config = SessionConfig::new(jid, "secret");
        config.transfer_proxies = "<local>".to_string();
        config
    }

    pub(crate) fn drain_actions(session: &mut Session) -> Vec<SessionAction> {
        std::iter::from_fn(|| session.poll_action()).collect()
    }

    pub(crate) fn drain_events(session: &mut Session) -> Vec<GatewayEvent> {
        std::iter::from_fn(|| session.poll_event()).collect()
    }

    pub(crate) fn ready_session(jid: &str) -> Session {
        ready_session_with(config(jid))
    }

    /// Drive a session through PLAIN auth, bind and session to Ready.
    pub(crate) fn ready_session_with(config: SessionConfig) -> Session {
        let mut s = Session::new(config).unwrap();
        s.on_connecting();
        s.on_connected();
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(FEATURES_PLAIN.as_bytes());
        s.on_bytes(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        s.take_output();
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(FEATURES_BIND.as_bytes());

        let bind = sent_stanzas(&s.take_output()).remove(0);
        let full = s.jid().with_resource("gateway").to_string();
        let reply = format!(
            "<iq type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>{}</jid></bind></iq>",
            bind.attr("id").unwrap(),
            full
        );
        s.on_bytes(reply.as_bytes());
        let session_iq = sent_stanzas(&s.take_output()).remove(0);
        s.on_bytes(format!("<iq type='result' id='{}'/>", session_iq.attr("id").unwrap()).as_bytes());
        assert_eq!(s.state(), SessionState::Ready);
        s
    }

    #[test]
    fn test_starttls_restarts_stream_once() {
        let mut s = Session::new(config("alice@example.org")).unwrap();
        s.on_connecting();
        s.on_connected();
        let open = String::from_utf8(s.take_output()).unwrap();
        assert!(open.starts_with("<?xml version='1.0' ?><stream:stream to=\"example.org\""));

        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(
            b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
              <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
              </stream:features>",
        );
        assert_eq!(s.state(), SessionState::SecuringTransport);
        assert_eq!(
            String::from_utf8(s.take_output()).unwrap(),
            "<starttls xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>"
        );

        s.on_bytes(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        let actions = drain_actions(&mut s);
        assert_eq!(actions, vec![SessionAction::StartTls]);

        s.on_transport_secured();
        assert_eq!(s.state(), SessionState::StreamOpened);
        assert!(String::from_utf8(s.take_output())
            .unwrap()
            .contains("<stream:stream to=\"example.org\""));

        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(FEATURES_PLAIN.as_bytes());
        assert_eq!(s.state(), SessionState::Authenticating);
        assert_eq!(
            String::from_utf8(s.take_output()).unwrap(),
            "<auth xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\" mechanism=\"PLAIN\">AGFsaWNlAHNlY3JldA==</auth>"
        );
        assert_eq!(s.parser_resets(), 1);
        assert!(drain_actions(&mut s).is_empty());
        assert!(s.flags().tls_done);
    }

    #[test]
    fn test_tls_required_but_not_offered_is_fatal() {
        let mut cfg = config("alice@example.org");
        cfg.tls = TlsPolicy::Required;
        let mut s = Session::new(cfg).unwrap();
        s.on_connecting();
        s.on_connected();
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(FEATURES_PLAIN.as_bytes());
        assert_eq!(s.state(), SessionState::Disconnected);
        let events = drain_events(&mut s);
        assert!(matches!(
            events.as_slice(),
            [GatewayEvent::FatalError { retryable: false, .. }]
        ));
        assert_eq!(drain_actions(&mut s), vec![SessionAction::Disconnect]);
    }

    #[test]
    fn test_login_to_ready_with_bind_and_session() {
        let mut s = ready_session("alice@example.org");
        assert_eq!(s.parser_resets(), 1);
        assert!(s.flags().authenticated);
        let events = drain_events(&mut s);
        assert!(events.iter().any(|e| matches!(
            e,
            GatewayEvent::Ready { jid } if jid.to_string() == "alice@example.org/gateway"
        )));
        assert_eq!(s.pending_requests(), 0);
    }

    #[test]
    fn test_server_assigned_resource_is_adopted() {
        let mut s = Session::new(config("alice@example.org")).unwrap();
        s.on_connecting();
        s.on_connected();
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(FEATURES_PLAIN.as_bytes());
        s.on_bytes(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>");
        let bind = sent_stanzas(&s.take_output())
            .into_iter()
            .find(|e| e.name() == "iq")
            .unwrap();
        s.on_bytes(
            format!(
                "<iq type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <jid>alice@example.org/gateway-4f2a</jid></bind></iq>",
                bind.attr("id").unwrap()
            )
            .as_bytes(),
        );
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(s.jid().resource(), Some("gateway-4f2a"));
    }

    #[test]
    fn test_sasl_failure_is_not_retryable() {
        let mut s = Session::new(config("alice@example.org")).unwrap();
        s.on_connecting();
        s.on_connected();
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(FEATURES_PLAIN.as_bytes());
        s.on_bytes(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>");
        let events = drain_events(&mut s);
        assert_eq!(events.len(), 1);
        match &events[0] {
            GatewayEvent::FatalError { message, retryable } => {
                assert!(!retryable);
                assert!(message.contains("not-authorized"), "{}", message);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_see_other_host_redirects_silently() {
        let mut s = Session::new(config("alice@example.org")).unwrap();
        s.on_connecting();
        s.on_connected();
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(
            b"<stream:error><see-other-host xmlns='urn:ietf:params:xml:ns:xmpp-streams'>\
              xmpp2.example.org:5223</see-other-host></stream:error>",
        );
        // Anything after the redirect is ignored
        s.on_bytes(b"</stream:stream>");
        assert_eq!(
            drain_actions(&mut s),
            vec![SessionAction::Redirect {
                host: "xmpp2.example.org".to_string(),
                port: 5223
            }]
        );
        assert!(drain_events(&mut s).is_empty());

        s.restart_for_redirect();
        assert_eq!(s.state(), SessionState::Connecting);
        s.on_connected();
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(FEATURES_PLAIN.as_bytes());
        assert_eq!(s.state(), SessionState::Authenticating);
    }

    #[test]
    fn test_conflict_stream_error_is_not_retryable() {
        let mut s = ready_session("alice@example.org");
        drain_events(&mut s);
        s.on_bytes(
            b"<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
              <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Replaced by new connection</text>\
              </stream:error></stream:stream>",
        );
        let events = drain_events(&mut s);
        assert_eq!(events.len(), 1, "{:?}", events);
        assert!(matches!(
            &events[0],
            GatewayEvent::FatalError { retryable: false, message } if message.contains("Replaced")
        ));
    }

    #[test]
    fn test_remote_close_and_malformed_input_are_fatal() {
        let mut s = ready_session("alice@example.org");
        drain_events(&mut s);
        s.on_bytes(b"</stream:stream>");
        assert!(matches!(
            drain_events(&mut s).as_slice(),
            [GatewayEvent::FatalError { retryable: true, .. }]
        ));

        let mut s = ready_session("alice@example.org");
        drain_events(&mut s);
        s.on_bytes(b"<message><body>hi</message>");
        assert!(matches!(
            drain_events(&mut s).as_slice(),
            [GatewayEvent::FatalError { retryable: true, .. }]
        ));
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_keepalive_only_when_ready() {
        let mut s = Session::new(config("alice@example.org")).unwrap();
        s.on_connecting();
        s.on_connected();
        s.take_output();
        s.on_tick(Instant::now());
        assert!(!s.has_pending_output());

        let mut s = ready_session("alice@example.org");
        s.take_output();
        s.on_tick(Instant::now());
        assert_eq!(s.take_output(), b"\n");
    }

    #[test]
    fn test_tracked_reply_reaches_resolver_and_others_pass_through() {
        let mut s = ready_session("alice@example.org");
        drain_events(&mut s);
        s.take_output();

        let id = s.send_tracked(
            stanza::iq("get", Some("bob@example.org"), Some(stanza::query("jabber:iq:last"))),
            Box::new(|core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.log(format!("last activity: {}", reply.attr("type").unwrap_or("")));
                HandlerStatus::Handled
            }),
        ).unwrap();
        assert!(id.starts_with("jgT"));
        assert_eq!(s.pending_requests(), 1);

        s.on_bytes(format!("<iq type='result' id='{}' from='bob@example.org'/>", id).as_bytes());
        s.on_bytes(b"<iq type='result' id='foreign1'/><message from='bob@example.org'><body>hi</body></message>");
        let events = drain_events(&mut s);
        assert_eq!(events[0], GatewayEvent::Log("last activity: result".to_string()));
        assert!(matches!(&events[1], GatewayEvent::Stanza(e) if e.name() == "iq"));
        assert!(matches!(&events[2], GatewayEvent::Stanza(e) if e.name() == "message"));
        assert_eq!(s.pending_requests(), 0);
    }

    #[test]
    fn test_builtin_ping_and_disco_replies() {
        let mut s = ready_session("alice@example.org");
        s.take_output();
        s.on_bytes(
            b"<iq type='get' id='p1' from='example.org'><ping xmlns='urn:xmpp:ping'/></iq>\
              <iq type='get' id='d1' from='bob@example.org/pc'>\
              <query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        );
        let sent = sent_stanzas(&s.take_output());
        assert_eq!(sent[0].attr("type"), Some("result"));
        assert_eq!(sent[0].attr("id"), Some("p1"));
        assert_eq!(sent[0].attr("to"), Some("example.org"));
        let query = sent[1].child("query").unwrap();
        let features: Vec<&str> = query
            .children_named("feature")
            .filter_map(|f| f.attr("var"))
            .collect();
        assert!(features.contains(&"http://jabber.org/protocol/bytestreams"));
        assert!(features.contains(&"http://jabber.org/protocol/si/profile/file-transfer"));
    }

    #[test]
    fn test_close_sends_goodbye_and_cancels_pending() {
        let mut s = ready_session("alice@example.org");
        s.take_output();
        s.send_tracked(
            stanza::iq("get", Some("example.org"), Some(stanza::query("jabber:iq:roster"))),
            Box::new(|_: &mut SessionCore, _: &Element, _: &Element| HandlerStatus::Handled),
        )
        .unwrap();
        s.take_output();
        s.close();
        assert_eq!(
            String::from_utf8(s.take_output()).unwrap(),
            "<presence type=\"unavailable\"/></stream:stream>"
        );
        assert_eq!(s.pending_requests(), 0);
        assert_eq!(s.state(), SessionState::Closing);
        assert!(drain_actions(&mut s).contains(&SessionAction::Disconnect));

        // The server's closing tag is expected now
        s.on_bytes(b"</stream:stream>");
        assert!(!drain_events(&mut s)
            .iter()
            .any(|e| matches!(e, GatewayEvent::FatalError { .. })));
    }

    #[test]
    fn test_close_skips_goodbye_with_queued_output() {
        let mut s = ready_session("alice@example.org");
        s.take_output();
        s.send_untracked(Element::new("presence")).unwrap();
        s.close();
        assert_eq!(String::from_utf8(s.take_output()).unwrap(), "<presence/>");
    }

    #[test]
    fn test_collaborator_stanzas_wait_for_ready() {
        let mut s = Session::new(config("alice@example.org")).unwrap();
        s.on_connecting();
        s.on_connected();
        s.take_output();

        let message = Element::new("message").with_attr("to", "bob@example.org");
        assert!(matches!(
            s.send_untracked(message.clone()),
            Err(SessionError::NotReady)
        ));
        assert!(matches!(
            s.send_tracked(
                stanza::iq("get", Some("example.org"), Some(stanza::query("jabber:iq:roster"))),
                Box::new(|_: &mut SessionCore, _: &Element, _: &Element| HandlerStatus::Handled),
            ),
            Err(SessionError::NotReady)
        ));
        assert!(s.take_output().is_empty());
        assert_eq!(s.pending_requests(), 0);

        // Mid-negotiation is no different
        s.on_bytes(SERVER_OPEN.as_bytes());
        s.on_bytes(FEATURES_PLAIN.as_bytes());
        s.take_output();
        assert!(s.send_untracked(message.clone()).is_err());
        assert!(s.take_output().is_empty());

        let mut ready = ready_session("alice@example.org");
        ready.take_output();
        ready.send_untracked(message).unwrap();
        assert_eq!(
            String::from_utf8(ready.take_output()).unwrap(),
            "<message to=\"bob@example.org\"/>"
        );
    }

    #[test]
    fn test_legacy_auth_without_stream_version() {
        let mut s = Session::new(config("alice@example.org")).unwrap();
        s.on_connecting();
        s.on_connected();
        s.take_output();
        s.on_bytes(
            b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' id='3EE948B0' from='example.org'>",
        );
        assert_eq!(s.state(), SessionState::Authenticating);
        let get = sent_stanzas(&s.take_output()).remove(0);
        assert_eq!(get.attr("type"), Some("get"));
        s.on_bytes(
            format!(
                "<iq type='result' id='{}'><query xmlns='jabber:iq:auth'>\
                 <username/><password/><digest/><resource/></query></iq>",
                get.attr("id").unwrap()
            )
            .as_bytes(),
        );
        let set = sent_stanzas(&s.take_output()).remove(0);
        let query = set.child("query").unwrap();
        assert_eq!(query.child_text("username"), Some("alice"));
        assert_eq!(query.child_text("resource"), Some("gateway"));
        assert_eq!(query.child_text("digest"), Some(auth::legacy_digest("3EE948B0", "secret").as_str()));
        assert!(query.child("password").is_none());

        s.on_bytes(format!("<iq type='result' id='{}'/>", set.attr("id").unwrap()).as_bytes());
        assert_eq!(s.state(), SessionState::Ready);
    }
}
