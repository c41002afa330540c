//! Stream initiation (file offers) and SOCKS5 bytestream negotiation, run on
//! the session's stanza stream.
//!
//! Sender: disco#info on the peer, SI offer, optional local listener,
//! streamhost list, then either direct sending or proxy activation.
//! Receiver: offer reported to the user, accept, streamhost list from the
//! peer, connect through the candidates, `streamhost-used` back.

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{
    Candidate, PeerTermination, Phase, Progress, Role, Transfer, TransferAction, TransferId,
    TransferUpdate,
};
use crate::cache::Resolver;
use crate::error::{TransferError, TransferResult};
use crate::events::{GatewayEvent, TransferEvent};
use crate::session::{SessionAction, SessionCore};
use crate::stanza::{self, ns, StanzaError};
use crate::xmltree::{Element, HandlerStatus};

/// Length of generated stream ids.
const SID_LEN: usize = 16;

/// Port assumed for a streamhost that names none.
const DEFAULT_STREAMHOST_PORT: u16 = 1080;

fn new_sid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SID_LEN)
        .map(char::from)
        .collect()
}

/// `<feature/>` form carrying the stream-method field.
fn stream_method_form(form_type: &str, options: bool) -> Element {
    let mut field = Element::new("field").with_attr("var", "stream-method");
    if options {
        field.set_attr("type", "list-single");
        field.push_child(
            Element::new("option").with_child(Element::new("value").with_text(ns::BYTESTREAMS)),
        );
    } else {
        field.push_child(Element::new("value").with_text(ns::BYTESTREAMS));
    }
    Element::new("feature").with_attr("xmlns", ns::FEATURE_NEG).with_child(
        Element::new("x")
            .with_attr("xmlns", ns::XDATA)
            .with_attr("type", form_type)
            .with_child(field),
    )
}

/// Values of the stream-method field in an SI element, whether offered as
/// options or chosen as a value.
fn stream_methods(si: &Element) -> Vec<String> {
    let Some(field) = si
        .child_ns("feature", ns::FEATURE_NEG)
        .and_then(|f| f.child_ns("x", ns::XDATA))
        .and_then(|x| {
            x.children_named("field")
                .find(|f| f.attr("var") == Some("stream-method"))
        })
    else {
        return Vec::new();
    };
    let mut methods: Vec<String> = field
        .children_named("option")
        .filter_map(|o| o.child_text("value"))
        .map(|v| v.trim().to_string())
        .collect();
    methods.extend(field.children_named("value").map(|v| v.text().trim().to_string()));
    methods
}

/// Reply addressed to a request we only kept the id of.
fn reply_to(kind: &str, peer: &str, id: Option<&str>, child: Option<Element>) -> Element {
    let mut reply = stanza::iq(kind, Some(peer), child);
    if let Some(id) = id {
        reply.set_attr("id", id);
    }
    reply
}

/// Error reply to a request we only kept the id of.
fn error_to(peer: &str, id: Option<&str>, condition: &str, error_type: &str) -> Element {
    let mut request = Element::new("iq").with_attr("from", peer);
    if let Some(id) = id {
        request.set_attr("id", id);
    }
    stanza::error_reply(&request, condition, error_type, None)
}

impl SessionCore {
    /// Start offering a file; the caller has checked the session is ready.
    pub(crate) fn offer_transfer(&mut self, to: &str, name: &str, size: u64) -> TransferId {
        let id = self.transfers.allocate_id();
        self.transfers.insert(Transfer {
            id,
            role: Role::Sender,
            sid: new_sid(),
            peer: to.to_string(),
            initiator: self.jid.to_string(),
            target: to.to_string(),
            file_name: name.to_string(),
            phase: Phase::CheckingPeer,
            candidates: Vec::new(),
            progress: Progress::new(size),
            offer_iq_id: None,
            bytestream_iq_id: None,
            awaiting: None,
        });
        info!(transfer = %id, peer = to, file = name, size, "offering file");

        let request = stanza::iq("get", Some(to), Some(stanza::query(ns::DISCO_INFO)));
        self.send_for_transfer(
            id,
            request,
            Box::new(move |core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_peer_features(id, reply);
                HandlerStatus::Handled
            }),
        );
        id
    }

    fn on_peer_features(&mut self, id: TransferId, reply: &Element) {
        if !self.in_phase(id, Phase::CheckingPeer) {
            return;
        }
        if let Some(error) = StanzaError::from_stanza(reply) {
            self.terminate(id, format!("could not query peer features: {}", error));
            return;
        }
        let features: Vec<&str> = reply
            .child_ns("query", ns::DISCO_INFO)
            .map(|q| q.children_named("feature").filter_map(|f| f.attr("var")).collect())
            .unwrap_or_default();
        let supported = [ns::SI, ns::SI_FILE_TRANSFER, ns::BYTESTREAMS]
            .iter()
            .all(|needed| features.contains(needed));
        if !supported {
            self.terminate(id, "peer does not support file transfers".to_string());
            return;
        }
        self.send_offer(id);
    }

    fn send_offer(&mut self, id: TransferId) {
        let Some(transfer) = self.transfers.get_mut(id) else {
            return;
        };
        transfer.phase = Phase::AwaitingAccept;
        let si = Element::new("si")
            .with_attr("xmlns", ns::SI)
            .with_attr("id", transfer.sid.as_str())
            .with_attr("profile", ns::SI_FILE_TRANSFER)
            .with_attr("mime-type", "application/octet-stream")
            .with_child(
                Element::new("file")
                    .with_attr("xmlns", ns::SI_FILE_TRANSFER)
                    .with_attr("name", transfer.file_name.as_str())
                    .with_attr("size", transfer.progress.total.to_string()),
            )
            .with_child(stream_method_form("form", true));
        let request = stanza::iq("set", Some(transfer.peer.as_str()), Some(si));
        self.send_for_transfer(
            id,
            request,
            Box::new(move |core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_offer_reply(id, reply);
                HandlerStatus::Handled
            }),
        );
    }

    fn on_offer_reply(&mut self, id: TransferId, reply: &Element) {
        if !self.in_phase(id, Phase::AwaitingAccept) {
            return;
        }
        if let Some(error) = StanzaError::from_stanza(reply) {
            let why = PeerTermination::from_error(&error, Role::Receiver);
            self.terminate(id, why.to_string());
            return;
        }
        let chosen = reply
            .child_ns("si", ns::SI)
            .map(stream_methods)
            .unwrap_or_default();
        if !chosen.iter().any(|m| m == ns::BYTESTREAMS) {
            self.terminate(id, "peer chose an unsupported stream method".to_string());
            return;
        }

        if self.transfers.local_enabled() {
            let Some(transfer) = self.transfers.get_mut(id) else {
                return;
            };
            transfer.phase = Phase::Listening;
            let digest = transfer.digest();
            self.push_action(SessionAction::Transfer(TransferAction::Listen { id, digest }));
        } else {
            self.send_streamhosts(id, None);
        }
    }

    fn send_streamhosts(&mut self, id: TransferId, local: Option<Candidate>) {
        let candidates = self.transfers.sender_candidates(local);
        if candidates.is_empty() {
            self.terminate(id, "no streamhosts available".to_string());
            return;
        }
        let Some(transfer) = self.transfers.get_mut(id) else {
            return;
        };
        transfer.phase = Phase::AwaitingStreamhostUsed;
        let mut query = stanza::query(ns::BYTESTREAMS)
            .with_attr("sid", transfer.sid.as_str())
            .with_attr("mode", "tcp");
        for candidate in &candidates {
            query.push_child(
                Element::new("streamhost")
                    .with_attr("jid", candidate.jid.as_str())
                    .with_attr("host", candidate.host.as_str())
                    .with_attr("port", candidate.port.to_string()),
            );
        }
        debug!(transfer = %id, streamhosts = candidates.len(), "sending streamhosts");
        transfer.candidates = candidates;
        let request = stanza::iq("set", Some(transfer.peer.as_str()), Some(query));
        self.send_for_transfer(
            id,
            request,
            Box::new(move |core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_streamhost_used(id, reply);
                HandlerStatus::Handled
            }),
        );
    }

    fn on_streamhost_used(&mut self, id: TransferId, reply: &Element) {
        if !self.in_phase(id, Phase::AwaitingStreamhostUsed) {
            return;
        }
        if let Some(error) = StanzaError::from_stanza(reply) {
            let why = PeerTermination::from_error(&error, Role::Receiver);
            self.terminate(id, why.to_string());
            return;
        }
        let used = reply
            .child_ns("query", ns::BYTESTREAMS)
            .and_then(|q| q.child("streamhost-used"))
            .and_then(|s| s.attr("jid"))
            .unwrap_or_default();
        let Some(transfer) = self.transfers.get_mut(id) else {
            return;
        };
        let Some(candidate) = transfer.candidates.iter().find(|c| c.jid == used).cloned() else {
            self.terminate(id, format!("peer picked an unknown streamhost '{}'", used));
            return;
        };

        if candidate.relay {
            // The proxy is the only streamhost left in play
            transfer.phase = Phase::Activating;
            transfer.candidates = vec![candidate.clone()];
            let digest = transfer.digest();
            debug!(transfer = %id, proxy = %candidate.jid, "connecting to proxy");
            self.push_action(SessionAction::Transfer(TransferAction::ConnectProxy {
                id,
                candidate,
                digest,
            }));
        } else {
            transfer.phase = Phase::Transferring;
            self.push_action(SessionAction::Transfer(TransferAction::SendDirect { id }));
            self.emit(GatewayEvent::Transfer(TransferEvent::Started { id }));
        }
    }

    fn send_activate(&mut self, id: TransferId, candidate: usize) {
        let Some(transfer) = self.transfers.get(id) else {
            return;
        };
        let Some(proxy) = transfer.candidates.get(candidate) else {
            self.terminate(id, "proxy connection reported for an unknown streamhost".to_string());
            return;
        };
        let query = stanza::query(ns::BYTESTREAMS)
            .with_attr("sid", transfer.sid.as_str())
            .with_child(Element::new("activate").with_text(transfer.target.as_str()));
        let request = stanza::iq("set", Some(proxy.jid.as_str()), Some(query));
        self.send_for_transfer(
            id,
            request,
            Box::new(move |core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_activated(id, reply);
                HandlerStatus::Handled
            }),
        );
    }

    fn on_activated(&mut self, id: TransferId, reply: &Element) {
        if !self.in_phase(id, Phase::Activating) {
            return;
        }
        if let Some(error) = StanzaError::from_stanza(reply) {
            self.terminate(id, format!("proxy activation failed: {}", error));
            return;
        }
        if let Some(transfer) = self.transfers.get_mut(id) {
            transfer.phase = Phase::Transferring;
        }
        self.push_action(SessionAction::Transfer(TransferAction::StartSending { id }));
        self.emit(GatewayEvent::Transfer(TransferEvent::Started { id }));
    }

    /// Incoming `<si/>` offer.
    pub(crate) fn on_si_offer(&mut self, iq: &Element) {
        let from = iq.attr("from").unwrap_or_default();
        let Some(si) = iq.child_ns("si", ns::SI) else {
            return;
        };
        if si.attr("profile") != Some(ns::SI_FILE_TRANSFER) {
            let bad_profile = Element::new("bad-profile").with_attr("xmlns", ns::SI);
            let reply = stanza::error_reply(iq, "bad-request", "modify", Some(bad_profile));
            self.write_element(&reply);
            return;
        }
        let file = si.child_ns("file", ns::SI_FILE_TRANSFER);
        let sid = si.attr("id").filter(|s| !s.is_empty());
        let name = file.and_then(|f| f.attr("name")).filter(|n| !n.is_empty());
        let size = file
            .and_then(|f| f.attr("size"))
            .and_then(|s| s.trim().parse::<u64>().ok());
        let (Some(sid), Some(name), Some(size), false) = (sid, name, size, from.is_empty()) else {
            debug!(from, "malformed file offer");
            let reply = stanza::error_reply(iq, "bad-request", "modify", None);
            self.write_element(&reply);
            return;
        };
        if !stream_methods(si).iter().any(|m| m == ns::BYTESTREAMS) {
            let no_streams = Element::new("no-valid-streams").with_attr("xmlns", ns::SI);
            let reply = stanza::error_reply(iq, "bad-request", "cancel", Some(no_streams));
            self.write_element(&reply);
            return;
        }

        let id = self.transfers.allocate_id();
        self.transfers.insert(Transfer {
            id,
            role: Role::Receiver,
            sid: sid.to_string(),
            peer: from.to_string(),
            initiator: from.to_string(),
            target: self.jid.to_string(),
            file_name: name.to_string(),
            phase: Phase::Offered,
            candidates: Vec::new(),
            progress: Progress::new(size),
            offer_iq_id: iq.attr("id").map(str::to_string),
            bytestream_iq_id: None,
            awaiting: None,
        });
        info!(transfer = %id, peer = from, file = name, size, "file offered");
        self.emit(GatewayEvent::Transfer(TransferEvent::Offered {
            id,
            from: from.to_string(),
            name: name.to_string(),
            size,
        }));
    }

    pub(crate) fn accept_transfer(&mut self, id: TransferId) -> TransferResult<()> {
        let transfer = self
            .transfers
            .get_mut(id)
            .ok_or(TransferError::NotFound(id.0))?;
        if transfer.role != Role::Receiver || transfer.phase != Phase::Offered {
            return Err(TransferError::InvalidState {
                id: id.0,
                action: "accepted",
            });
        }
        transfer.phase = Phase::AwaitingStreamhosts;
        let si = Element::new("si")
            .with_attr("xmlns", ns::SI)
            .with_child(stream_method_form("submit", false));
        let reply = reply_to("result", &transfer.peer, transfer.offer_iq_id.take().as_deref(), Some(si));
        debug!(transfer = %id, "accepted file offer");
        self.write_element(&reply);
        Ok(())
    }

    /// Cancel on the user's request. Requests we still owe an answer to are
    /// refused, so the peer learns about it.
    pub(crate) fn cancel_transfer(&mut self, id: TransferId, reason: &str) -> TransferResult<()> {
        let transfer = self
            .transfers
            .get_mut(id)
            .ok_or(TransferError::NotFound(id.0))?;
        let owed = transfer
            .offer_iq_id
            .take()
            .or_else(|| transfer.bytestream_iq_id.take());
        if let Some(owed) = owed {
            let reply = error_to(&transfer.peer, Some(&owed), "forbidden", "cancel");
            self.write_element(&reply);
        }
        self.terminate(id, reason.to_string());
        Ok(())
    }

    /// Incoming streamhost list for a transfer we accepted.
    pub(crate) fn on_bytestream_request(&mut self, iq: &Element) {
        let from = iq.attr("from").unwrap_or_default();
        let Some(query) = iq.child_ns("query", ns::BYTESTREAMS) else {
            return;
        };
        let sid = query.attr("sid").unwrap_or_default();
        let Some(id) = self.transfers.find_incoming(sid, from) else {
            debug!(sid, from, "bytestream request for an unknown stream");
            let reply = stanza::error_reply(iq, "item-not-found", "cancel", None);
            self.write_element(&reply);
            return;
        };
        if !self.in_phase(id, Phase::AwaitingStreamhosts) {
            let reply = stanza::error_reply(iq, "not-acceptable", "cancel", None);
            self.write_element(&reply);
            return;
        }
        if query.attr("mode").is_some_and(|m| m != "tcp") {
            let reply = stanza::error_reply(iq, "not-acceptable", "cancel", None);
            self.write_element(&reply);
            self.terminate(id, "peer requested an unsupported bytestream mode".to_string());
            return;
        }

        let Some(transfer) = self.transfers.get_mut(id) else {
            return;
        };
        let candidates: Vec<Candidate> = query
            .children_named("streamhost")
            .filter_map(|sh| {
                let jid = sh.attr("jid").filter(|j| !j.is_empty())?;
                let host = sh.attr("host").filter(|h| !h.is_empty())?;
                let port = match sh.attr("port") {
                    Some(p) => p.trim().parse().ok()?,
                    None => DEFAULT_STREAMHOST_PORT,
                };
                Some(Candidate {
                    jid: jid.to_string(),
                    host: host.to_string(),
                    port,
                    relay: jid != transfer.initiator,
                })
            })
            .collect();
        if candidates.is_empty() {
            let reply = stanza::error_reply(iq, "item-not-found", "cancel", None);
            self.write_element(&reply);
            self.terminate(id, "peer offered no usable streamhosts".to_string());
            return;
        }

        transfer.phase = Phase::Connecting;
        transfer.bytestream_iq_id = iq.attr("id").map(str::to_string);
        transfer.candidates = candidates.clone();
        let action = TransferAction::Receive {
            id,
            candidates,
            digest: transfer.digest(),
            size: transfer.progress.total,
        };
        self.push_action(SessionAction::Transfer(action));
    }

    /// Socket outcome reported by the driver.
    pub(crate) fn on_transfer_update(&mut self, update: TransferUpdate) {
        let id = update.id();
        let Some(transfer) = self.transfers.get_mut(id) else {
            debug!(transfer = %id, "update for a finished transfer");
            return;
        };
        let (role, phase) = (transfer.role, transfer.phase);
        match update {
            TransferUpdate::Listening { host, port, .. } if phase == Phase::Listening => {
                let local = Candidate {
                    jid: self.jid.to_string(),
                    host,
                    port,
                    relay: false,
                };
                self.send_streamhosts(id, Some(local));
            }
            TransferUpdate::Failed { reason, .. } if phase == Phase::Listening => {
                warn!(transfer = %id, error = %reason, "local streamhost unavailable");
                self.send_streamhosts(id, None);
            }
            TransferUpdate::Connected { candidate, .. } => match (role, phase) {
                (Role::Receiver, Phase::Connecting) => {
                    let Some(used) = transfer.candidates.get(candidate).map(|c| c.jid.clone()) else {
                        return;
                    };
                    transfer.phase = Phase::Transferring;
                    let query = stanza::query(ns::BYTESTREAMS)
                        .with_attr("sid", transfer.sid.as_str())
                        .with_child(Element::new("streamhost-used").with_attr("jid", used));
                    let reply = reply_to(
                        "result",
                        &transfer.peer,
                        transfer.bytestream_iq_id.take().as_deref(),
                        Some(query),
                    );
                    self.write_element(&reply);
                    self.emit(GatewayEvent::Transfer(TransferEvent::Started { id }));
                }
                (Role::Sender, Phase::Activating) => self.send_activate(id, candidate),
                _ => debug!(transfer = %id, ?phase, "ignoring connection report"),
            },
            TransferUpdate::Progress { transferred, .. } => {
                transfer.progress.record(transferred);
                let total = transfer.progress.total;
                self.emit(GatewayEvent::Transfer(TransferEvent::Progress {
                    id,
                    transferred,
                    total,
                }));
            }
            TransferUpdate::Completed { transferred, .. } => self.finish(id, transferred),
            TransferUpdate::Failed { reason, .. } => {
                if role == Role::Receiver && phase == Phase::Connecting {
                    if let Some(owed) = transfer.bytestream_iq_id.take() {
                        let reply = error_to(&transfer.peer, Some(&owed), "item-not-found", "cancel");
                        self.write_element(&reply);
                    }
                }
                self.terminate(id, reason);
            }
            TransferUpdate::Listening { .. } => {
                debug!(transfer = %id, ?phase, "ignoring listener report");
            }
        }
    }

    /// Ask the server's service directory for bytestream proxies.
    pub(crate) fn start_proxy_discovery(&mut self) {
        if !self.transfers.auto_enabled() {
            return;
        }
        let domain = self.jid.domain().to_string();
        let request = stanza::iq("get", Some(domain.as_str()), Some(stanza::query(ns::DISCO_ITEMS)));
        self.send_tracked(
            request,
            Box::new(|core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_disco_items(reply);
                HandlerStatus::Handled
            }),
        );
    }

    fn on_disco_items(&mut self, reply: &Element) {
        if let Some(error) = StanzaError::from_stanza(reply) {
            debug!(error = %error, "service discovery failed");
            return;
        }
        let items: Vec<String> = reply
            .child_ns("query", ns::DISCO_ITEMS)
            .map(|q| {
                q.children_named("item")
                    .filter_map(|i| i.attr("jid"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        for item in items {
            let request = stanza::iq("get", Some(item.as_str()), Some(stanza::query(ns::DISCO_INFO)));
            self.send_tracked(
                request,
                Box::new(move |core: &mut SessionCore, reply: &Element, _request: &Element| {
                    core.on_item_info(&item, reply);
                    HandlerStatus::Handled
                }),
            );
        }
    }

    fn on_item_info(&mut self, item: &str, reply: &Element) {
        let is_proxy = reply
            .child_ns("query", ns::DISCO_INFO)
            .is_some_and(|q| {
                q.children_named("identity").any(|i| {
                    i.attr("category") == Some("proxy") && i.attr("type") == Some("bytestreams")
                })
            });
        if !is_proxy {
            return;
        }
        let request = stanza::iq("get", Some(item), Some(stanza::query(ns::BYTESTREAMS)));
        self.send_tracked(
            request,
            Box::new(|core: &mut SessionCore, reply: &Element, _request: &Element| {
                core.on_proxy_address(reply);
                HandlerStatus::Handled
            }),
        );
    }

    fn on_proxy_address(&mut self, reply: &Element) {
        let Some(query) = reply.child_ns("query", ns::BYTESTREAMS) else {
            return;
        };
        for streamhost in query.children_named("streamhost") {
            let (Some(jid), Some(host), Some(port)) = (
                streamhost.attr("jid"),
                streamhost.attr("host"),
                streamhost.attr("port").and_then(|p| p.parse::<u16>().ok()),
            ) else {
                continue;
            };
            info!(proxy = jid, host, port, "discovered bytestream proxy");
            self.transfers.add_discovered(Candidate {
                jid: jid.to_string(),
                host: host.to_string(),
                port,
                relay: true,
            });
        }
    }

    /// Send a negotiation request and remember its id on the transfer, so
    /// the transfer ends if the reply never comes.
    fn send_for_transfer(
        &mut self,
        id: TransferId,
        request: Element,
        resolver: Resolver<SessionCore>,
    ) {
        let request_id = self.send_tracked(request, resolver);
        if let Some(transfer) = self.transfers.get_mut(id) {
            transfer.awaiting = Some(request_id);
        }
    }

    /// End transfers whose pending negotiation request was swept from the
    /// cache unanswered.
    pub(crate) fn expire_transfer_requests(&mut self, expired: &[String]) {
        let stalled: Vec<TransferId> = self
            .transfers
            .ids()
            .into_iter()
            .filter(|id| {
                self.transfers
                    .get(*id)
                    .and_then(|t| t.awaiting.as_ref())
                    .is_some_and(|pending| expired.contains(pending))
            })
            .collect();
        for id in stalled {
            warn!(transfer = %id, "negotiation request got no reply");
            self.terminate(id, "timed out waiting for the peer".to_string());
        }
    }

    fn in_phase(&self, id: TransferId, phase: Phase) -> bool {
        self.transfers.get(id).is_some_and(|t| t.phase == phase)
    }

    fn finish(&mut self, id: TransferId, transferred: u64) {
        if let Some(transfer) = self.transfers.remove(id) {
            info!(transfer = %id, file = %transfer.file_name, transferred, "transfer finished");
            self.push_action(SessionAction::Transfer(TransferAction::Release { id }));
            self.emit(GatewayEvent::Transfer(TransferEvent::Finished { id, transferred }));
        }
    }

    fn terminate(&mut self, id: TransferId, reason: String) {
        if let Some(transfer) = self.transfers.remove(id) {
            info!(transfer = %id, file = %transfer.file_name, reason = %reason, "transfer canceled");
            self.push_action(SessionAction::Transfer(TransferAction::Release { id }));
            self.emit(GatewayEvent::Transfer(TransferEvent::Canceled { id, reason }));
        }
    }

    pub(crate) fn cancel_all_transfers(&mut self, reason: &str) {
        for id in self.transfers.ids() {
            self.terminate(id, reason.to_string());
        }
    }
}
