//! Protocol constants, stanza builders and error parsing.

use crate::xmltree::Element;

/// XML namespaces used on the wire.
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const AUTH: &str = "jabber:iq:auth";
    pub const VERSION: &str = "jabber:iq:version";
    pub const PING: &str = "urn:xmpp:ping";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const SI: &str = "http://jabber.org/protocol/si";
    pub const SI_FILE_TRANSFER: &str = "http://jabber.org/protocol/si/profile/file-transfer";
    pub const FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";
    pub const XDATA: &str = "jabber:x:data";
    pub const BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";
}

/// Name of the stream root element.
pub const STREAM_ROOT: &str = "stream:stream";

pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Default client port, used when a redirect names only a host.
pub const DEFAULT_CLIENT_PORT: u16 = 5222;

/// Opening declaration sent at connect and on every stream restart.
pub fn stream_open(domain: &str) -> String {
    format!(
        "<?xml version='1.0' ?><stream:stream to=\"{}\" xmlns=\"{}\" xmlns:stream=\"{}\" version=\"1.0\">",
        quick_xml::escape::escape(domain),
        ns::CLIENT,
        ns::STREAMS
    )
}

/// `<iq type=... [to=...]>child</iq>`; the id is stamped when sending.
pub fn iq(kind: &str, to: Option<&str>, child: Option<Element>) -> Element {
    let mut iq = Element::new("iq").with_attr("type", kind);
    if let Some(to) = to {
        iq.set_attr("to", to);
    }
    if let Some(child) = child {
        iq.push_child(child);
    }
    iq
}

/// `<query xmlns=.../>`
pub fn query(namespace: &str) -> Element {
    Element::new("query").with_attr("xmlns", namespace)
}

/// Result reply to a request, addressed back to its sender.
pub fn result_reply(request: &Element, child: Option<Element>) -> Element {
    let mut reply = iq("result", request.attr("from"), child);
    if let Some(id) = request.attr("id") {
        reply.set_attr("id", id);
    }
    reply
}

/// Error reply with a defined condition, its legacy numeric code and an
/// optional application-specific child.
pub fn error_reply(
    request: &Element,
    condition: &str,
    error_type: &str,
    app_condition: Option<Element>,
) -> Element {
    let mut error = Element::new("error")
        .with_attr("type", error_type)
        .with_child(Element::new(condition).with_attr("xmlns", ns::STANZA_ERRORS));
    if let Some(code) = legacy_code(condition) {
        error.set_attr("code", code.to_string());
    }
    if let Some(app) = app_condition {
        error.push_child(app);
    }
    let mut reply = Element::new(request.name()).with_attr("type", "error");
    if let Some(from) = request.attr("from") {
        reply.set_attr("to", from);
    }
    if let Some(id) = request.attr("id") {
        reply.set_attr("id", id);
    }
    reply.with_child(error)
}

/// Legacy numeric code for a stanza error condition.
pub fn legacy_code(condition: &str) -> Option<u16> {
    Some(match condition {
        "bad-request" => 400,
        "not-authorized" => 401,
        "forbidden" => 403,
        "item-not-found" => 404,
        "not-allowed" => 405,
        "not-acceptable" => 406,
        "registration-required" => 407,
        "conflict" => 409,
        "internal-server-error" => 500,
        "feature-not-implemented" => 501,
        "remote-server-not-found" => 502,
        "service-unavailable" => 503,
        "remote-server-timeout" => 504,
        _ => return None,
    })
}

/// Condition for a legacy numeric code, for peers that only send `code`.
pub fn condition_from_code(code: u16) -> Option<&'static str> {
    Some(match code {
        302 => "redirect",
        400 => "bad-request",
        401 => "not-authorized",
        402 => "payment-required",
        403 => "forbidden",
        404 => "item-not-found",
        405 => "not-allowed",
        406 => "not-acceptable",
        407 => "registration-required",
        408 => "remote-server-timeout",
        409 => "conflict",
        500 => "internal-server-error",
        501 => "feature-not-implemented",
        502 => "service-unavailable",
        503 => "service-unavailable",
        504 => "remote-server-timeout",
        510 => "service-unavailable",
        _ => return None,
    })
}

/// Parsed `<error/>` child of a stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub condition: String,
    pub error_type: Option<String>,
    pub code: Option<u16>,
    pub text: Option<String>,
}

impl StanzaError {
    /// Extract the error of a `type='error'` stanza. Stanzas without an
    /// `<error/>` child yield an `undefined-condition` error.
    pub fn from_stanza(stanza: &Element) -> Option<Self> {
        if stanza.attr("type") != Some("error") {
            return None;
        }
        let Some(error) = stanza.child("error") else {
            return Some(Self {
                condition: "undefined-condition".to_string(),
                error_type: None,
                code: None,
                text: None,
            });
        };
        let code = error.attr("code").and_then(|c| c.parse::<u16>().ok());
        let condition = error
            .children()
            .iter()
            .find(|c| c.attr("xmlns") == Some(ns::STANZA_ERRORS) && c.name() != "text")
            .map(|c| c.name().to_string())
            .or_else(|| code.and_then(condition_from_code).map(str::to_string))
            .unwrap_or_else(|| "undefined-condition".to_string());
        let text = error
            .child("text")
            .map(|t| t.text().to_string())
            .or_else(|| Some(error.text().trim().to_string()).filter(|t| !t.is_empty()));
        Some(Self {
            condition,
            error_type: error.attr("type").map(str::to_string),
            code,
            text,
        })
    }
}

impl std::fmt::Display for StanzaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.condition)?;
        if let Some(text) = &self.text {
            write!(f, " ({})", text)?;
        }
        Ok(())
    }
}

/// Parsed `<stream:error/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: String,
    pub text: Option<String>,
    /// Replacement server named by `see-other-host`
    pub redirect: Option<(String, u16)>,
}

impl StreamError {
    pub fn from_element(error: &Element) -> Self {
        let mut condition = "undefined-condition".to_string();
        let mut text = None;
        let mut redirect = None;
        for child in error.children() {
            if child.name() == "text" {
                text = Some(child.text().to_string()).filter(|t| !t.is_empty());
            } else if child.attr("xmlns") == Some(ns::STREAM_ERRORS) {
                condition = child.name().to_string();
                if child.name() == "see-other-host" {
                    redirect = parse_host_port(child.text(), DEFAULT_CLIENT_PORT);
                }
            }
        }
        Self {
            condition,
            text,
            redirect,
        }
    }

    /// Conflicts and authorization failures won't heal by reconnecting.
    pub fn retryable(&self) -> bool {
        !matches!(self.condition.as_str(), "conflict" | "not-authorized")
    }
}

/// Split `host`, `host:port`, `[v6]` or `[v6]:port`. A bare IPv6 address
/// without brackets is taken as a host.
pub fn parse_host_port(input: &str, default_port: u16) -> Option<(String, u16)> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match input.split_once(':') {
        Some((host, port)) if !port.contains(':') => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => Some((input.to_string(), default_port)),
        None => Some((input.to_string(), default_port)),
    }
}
