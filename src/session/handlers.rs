//! Dispatch table for the session stream, and the negotiation steps the
//! handlers drive.

use tracing::{debug, info, warn};

use super::auth::{self, ChallengeReply, Mechanism};
use super::{SessionAction, SessionCore, SessionState};
use crate::config::TlsPolicy;
use crate::events::GatewayEvent;
use crate::jid::Jid;
use crate::stanza::{self, ns, StanzaError, StreamError};
use crate::xmltree::{Element, HandlerEntry, HandlerStatus, NamePattern, NodeRef, ParentPattern};

const STREAM: ParentPattern = ParentPattern::Exact(stanza::STREAM_ROOT);

/// Handlers in priority order; the catch-all stanza entry comes last.
pub(super) fn table() -> Vec<HandlerEntry<SessionCore>> {
    use NamePattern::{Any, Exact};
    vec![
        HandlerEntry::new(Exact(stanza::STREAM_ROOT), ParentPattern::Root, on_stream_end),
        HandlerEntry::new(Exact("stream:features"), STREAM, on_features),
        HandlerEntry::new(Exact("stream:error"), STREAM, on_stream_error),
        HandlerEntry::new(Exact("proceed"), STREAM, on_proceed),
        HandlerEntry::new(Exact("failure"), STREAM, on_failure),
        HandlerEntry::new(Exact("challenge"), STREAM, on_challenge),
        HandlerEntry::new(Exact("success"), STREAM, on_success),
        HandlerEntry::new(Exact("iq"), STREAM, on_iq),
        HandlerEntry::new(Any, STREAM, on_stanza),
    ]
}

/// The root completes only when the server closes its stream.
fn on_stream_end(_node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    if core.state == SessionState::Closing {
        debug!("server closed the stream");
        return HandlerStatus::Handled;
    }
    core.fail("Connection closed by server", true)
}

fn on_features(node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    core.on_features(&node.to_element())
}

fn on_stream_error(node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    let error = StreamError::from_element(&node.to_element());
    if error.condition == "see-other-host" && core.state != SessionState::Ready {
        if let Some((host, port)) = error.redirect {
            info!(host = %host, port, "server redirected the session");
            core.redirecting = true;
            core.push_action(SessionAction::Redirect { host, port });
            return HandlerStatus::Abort;
        }
    }
    let message = match &error.text {
        Some(text) => format!("Stream error: {} ({})", error.condition, text),
        None => format!("Stream error: {}", error.condition),
    };
    core.fail(message, error.retryable())
}

fn on_proceed(node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    if node.attr("xmlns") != Some(ns::TLS) {
        return HandlerStatus::Next;
    }
    core.push_action(SessionAction::StartTls);
    HandlerStatus::Handled
}

fn on_failure(node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    match node.attr("xmlns") {
        Some(ns::TLS) => core.fail("TLS negotiation failed", true),
        Some(ns::SASL) => {
            let condition = node
                .children()
                .map(|c| c.name())
                .find(|name| *name != "text")
                .unwrap_or("undefined-condition");
            core.fail(format!("Authentication failure: {}", condition), false)
        }
        _ => HandlerStatus::Next,
    }
}

fn on_challenge(node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    if node.attr("xmlns") != Some(ns::SASL) {
        return HandlerStatus::Next;
    }
    let username = core.jid.node().unwrap_or_default().to_string();
    let reply = auth::digest_md5_reply(
        node.text(),
        &username,
        &core.config.password,
        core.jid.domain(),
        &auth::new_cnonce(),
    );
    let response = Element::new("response").with_attr("xmlns", ns::SASL);
    match reply {
        Ok(ChallengeReply::Response(text)) => core.write_element(&response.with_text(text)),
        Ok(ChallengeReply::Empty) => core.write_element(&response),
        Err(e) => return core.fail(format!("Authentication failure: {}", e), true),
    }
    HandlerStatus::Handled
}

fn on_success(node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    if node.attr("xmlns") != Some(ns::SASL) {
        return HandlerStatus::Next;
    }
    debug!(jid = %core.jid.bare(), "authenticated");
    core.flags.authenticated = true;
    core.restart_pending = true;
    HandlerStatus::Handled
}

fn on_iq(node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    let iq = node.to_element();
    match iq.attr("type") {
        Some("result") | Some("error") => core.on_iq_reply(iq),
        Some("get") | Some("set") => core.on_iq_request(iq),
        _ => {
            core.emit(GatewayEvent::Stanza(iq));
            HandlerStatus::Handled
        }
    }
}

fn on_stanza(node: NodeRef<'_>, core: &mut SessionCore) -> HandlerStatus {
    core.emit(GatewayEvent::Stanza(node.to_element()));
    HandlerStatus::Handled
}

/// Features answered by the built-in disco#info reply.
const FEATURES: &[&str] = &[
    ns::DISCO_INFO,
    ns::VERSION,
    ns::PING,
    ns::SI,
    ns::SI_FILE_TRANSFER,
    ns::BYTESTREAMS,
];

impl SessionCore {
    fn on_features(&mut self, features: &Element) -> HandlerStatus {
        if !self.flags.tls_done {
            let starttls = features.child_ns("starttls", ns::TLS);
            match (self.config.tls, starttls) {
                (TlsPolicy::Required | TlsPolicy::Try, Some(_)) => {
                    self.write_element(&Element::new("starttls").with_attr("xmlns", ns::TLS));
                    self.transition(SessionState::SecuringTransport);
                    return HandlerStatus::Handled;
                }
                (TlsPolicy::Required, None) => {
                    return self.fail("server does not support TLS, but it is required", false);
                }
                (TlsPolicy::Disabled, Some(tls)) if tls.child("required").is_some() => {
                    return self.fail("server requires TLS, but it is disabled", false);
                }
                _ => {}
            }
        }

        if self.flags.authenticated {
            self.flags.wants_bind = features.child_ns("bind", ns::BIND).is_some();
            self.flags.wants_session = features
                .child_ns("session", ns::SESSION)
                .is_some_and(|s| s.child("optional").is_none());
            self.begin_bind();
            return HandlerStatus::Handled;
        }
        if self.auth_started {
            return HandlerStatus::Handled;
        }
        match features.child_ns("mechanisms", ns::SASL) {
            Some(mechanisms) if self.config.sasl => self.begin_sasl(mechanisms),
            _ => {
                self.begin_legacy_auth();
                HandlerStatus::Handled
            }
        }
    }

    fn begin_sasl(&mut self, mechanisms: &Element) -> HandlerStatus {
        let offered: Vec<&str> = mechanisms
            .children_named("mechanism")
            .map(|m| m.text())
            .collect();
        let Some(mechanism) = auth::choose_mechanism(offered.iter().copied()) else {
            return self.fail(
                format!("no supported authentication mechanism (offered: {})", offered.join(", ")),
                false,
            );
        };
        self.auth_started = true;
        self.transition(SessionState::Authenticating);
        debug!(mechanism = mechanism.name(), "starting SASL");

        let mut request = Element::new("auth")
            .with_attr("xmlns", ns::SASL)
            .with_attr("mechanism", mechanism.name());
        if mechanism == Mechanism::Plain {
            let username = self.jid.node().unwrap_or_default();
            request = request.with_text(auth::plain_initial(username, &self.config.password));
        }
        self.write_element(&request);
        HandlerStatus::Handled
    }

    /// `jabber:iq:auth` for servers without SASL: ask for the fields, then
    /// answer with a digest when the server takes one.
    pub(super) fn begin_legacy_auth(&mut self) {
        self.auth_started = true;
        self.transition(SessionState::Authenticating);
        debug!("starting legacy authentication");
        let username = self.jid.node().unwrap_or_default().to_string();
        let request = stanza::iq(
            "get",
            Some(self.jid.domain()),
            Some(stanza::query(ns::AUTH).with_child(Element::new("username").with_text(username))),
        );
        self.send_tracked(
            request,
            Box::new(|core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_legacy_fields(reply)
            }),
        );
    }

    fn on_legacy_fields(&mut self, reply: &Element) -> HandlerStatus {
        if let Some(error) = StanzaError::from_stanza(reply) {
            return self.fail_legacy(&error);
        }
        let offers_digest = reply
            .child_ns("query", ns::AUTH)
            .is_some_and(|q| q.child("digest").is_some());
        let username = self.jid.node().unwrap_or_default().to_string();
        let resource = self.jid.resource().unwrap_or(&self.config.resource).to_string();
        let mut query = stanza::query(ns::AUTH)
            .with_child(Element::new("username").with_text(username))
            .with_child(Element::new("resource").with_text(resource));
        query = match (&self.stream_id, offers_digest) {
            (Some(id), true) => query.with_child(
                Element::new("digest").with_text(auth::legacy_digest(id, &self.config.password)),
            ),
            _ => query.with_child(Element::new("password").with_text(self.config.password.clone())),
        };
        let request = stanza::iq("set", Some(self.jid.domain()), Some(query));
        self.send_tracked(
            request,
            Box::new(|core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_legacy_result(reply)
            }),
        );
        HandlerStatus::Handled
    }

    fn on_legacy_result(&mut self, reply: &Element) -> HandlerStatus {
        if let Some(error) = StanzaError::from_stanza(reply) {
            return self.fail_legacy(&error);
        }
        self.flags.authenticated = true;
        self.become_ready();
        HandlerStatus::Handled
    }

    fn fail_legacy(&mut self, error: &StanzaError) -> HandlerStatus {
        let retryable = !matches!(error.condition.as_str(), "not-authorized" | "conflict");
        self.fail(format!("Authentication failure: {}", error), retryable)
    }

    fn begin_bind(&mut self) {
        if !self.flags.wants_bind {
            self.after_bind();
            return;
        }
        self.transition(SessionState::BindingResource);
        let resource = self.jid.resource().unwrap_or(&self.config.resource).to_string();
        let bind = Element::new("bind")
            .with_attr("xmlns", ns::BIND)
            .with_child(Element::new("resource").with_text(resource));
        self.send_tracked(
            stanza::iq("set", None, Some(bind)),
            Box::new(|core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_bind_reply(reply)
            }),
        );
    }

    fn on_bind_reply(&mut self, reply: &Element) -> HandlerStatus {
        if let Some(error) = StanzaError::from_stanza(reply) {
            let retryable = error.condition != "conflict";
            return self.fail(format!("Resource binding failed: {}", error), retryable);
        }
        let bound = reply
            .child_ns("bind", ns::BIND)
            .and_then(|b| b.child_text("jid"));
        if let Some(bound) = bound {
            match bound.parse::<Jid>() {
                Ok(jid) => self.jid = jid,
                Err(e) => warn!(error = %e, "server bound an unusable JID, keeping ours"),
            }
        }
        self.after_bind();
        HandlerStatus::Handled
    }

    fn after_bind(&mut self) {
        if !self.flags.wants_session {
            self.become_ready();
            return;
        }
        self.transition(SessionState::EstablishingSession);
        let session = Element::new("session").with_attr("xmlns", ns::SESSION);
        self.send_tracked(
            stanza::iq("set", Some(self.jid.domain()), Some(session)),
            Box::new(|core: &mut SessionCore, reply: &Element, _request: &Element| {
                if let Some(error) = StanzaError::from_stanza(reply) {
                    return core.fail(format!("Session establishment failed: {}", error), true);
                }
                core.become_ready();
                HandlerStatus::Handled
            }),
        );
    }

    fn on_iq_reply(&mut self, iq: Element) -> HandlerStatus {
        match self.cache.route(iq.attr("id")) {
            crate::cache::Route::Hit { request, resolver } => resolver(self, &iq, &request),
            crate::cache::Route::Drop => HandlerStatus::Handled,
            crate::cache::Route::PassThrough => {
                self.emit(GatewayEvent::Stanza(iq));
                HandlerStatus::Handled
            }
        }
    }

    fn on_iq_request(&mut self, iq: Element) -> HandlerStatus {
        if iq.children().is_empty() {
            self.emit(GatewayEvent::Stanza(iq));
            return HandlerStatus::Handled;
        }
        let payload = &iq.children()[0];
        let xmlns = payload.attr("xmlns").unwrap_or_default();
        match (iq.attr("type").unwrap_or_default(), payload.name(), xmlns) {
            ("get", "query", ns::DISCO_INFO) => {
                let mut query = stanza::query(ns::DISCO_INFO);
                if let Some(node) = payload.attr("node") {
                    query.set_attr("node", node);
                }
                query.push_child(
                    Element::new("identity")
                        .with_attr("category", "client")
                        .with_attr("type", "pc")
                        .with_attr("name", env!("CARGO_PKG_NAME")),
                );
                for feature in FEATURES {
                    query.push_child(Element::new("feature").with_attr("var", *feature));
                }
                let reply = stanza::result_reply(&iq, Some(query));
                self.write_element(&reply);
            }
            ("get", "query", ns::VERSION) => {
                let query = stanza::query(ns::VERSION)
                    .with_child(Element::new("name").with_text(env!("CARGO_PKG_NAME")))
                    .with_child(Element::new("version").with_text(env!("CARGO_PKG_VERSION")));
                let reply = stanza::result_reply(&iq, Some(query));
                self.write_element(&reply);
            }
            ("get", "ping", ns::PING) => {
                let reply = stanza::result_reply(&iq, None);
                self.write_element(&reply);
            }
            ("set", "si", ns::SI) => self.on_si_offer(&iq),
            ("set", "query", ns::BYTESTREAMS) => self.on_bytestream_request(&iq),
            _ => self.emit(GatewayEvent::Stanza(iq.clone())),
        }
        HandlerStatus::Handled
    }
}
