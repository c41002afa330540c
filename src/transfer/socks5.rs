//! SOCKS5 handshake for bytestream connections, without I/O.
//!
//! [`Socks5Connector`] walks the candidate streamhost list: it emits socket
//! and timer commands and consumes readiness events, moving on to the next
//! candidate whenever one fails. [`Socks5Acceptor`] is the streamhost side
//! used when we listen locally. Both are driven by `transfer::io`.

use std::time::Duration;

use sha1::{Digest, Sha1};

use super::Candidate;

/// Length of the destination address: SHA-1 hex of sid, initiator and target.
pub const DIGEST_HEX_LEN: usize = 40;

/// Bytes kept while waiting for a complete handshake record.
const LOOKAHEAD_CAPACITY: usize = 512;

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Destination address both sides of a bytestream agree on.
pub fn pseudo_address(sid: &str, initiator: &str, target: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.as_bytes());
    hasher.update(target.as_bytes());
    hex::encode(hasher.finalize())
}

/// Human readable text for a SOCKS5 reply code.
pub fn reply_code_text(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "unassigned",
    }
}

/// CONNECT request for the domain-name address `digest`.
pub fn connect_request(digest: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(7 + digest.len());
    msg.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0, ATYP_DOMAIN, digest.len() as u8]);
    msg.extend_from_slice(digest.as_bytes());
    msg.extend_from_slice(&[0, 0]);
    msg
}

/// Bounded buffer for partially received handshake records.
#[derive(Debug, Default)]
pub struct LookAhead {
    buf: Vec<u8>,
}

impl LookAhead {
    /// Append bytes, failing if a record grows past the capacity.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), String> {
        if self.buf.len() + bytes.len() > LOOKAHEAD_CAPACITY {
            return Err(format!(
                "handshake record exceeds {} bytes",
                LOOKAHEAD_CAPACITY
            ));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Remove and return the first `n` bytes once they are all present.
    pub fn take_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.buf.len() < n {
            return None;
        }
        Some(self.buf.drain(..n).collect())
    }

    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Idle,
    Connecting,
    HandshakeGreeting,
    HandshakeAuthAck,
    HandshakeConnectRequest,
    HandshakeConnectReply,
    Established,
    Exhausted,
}

impl ConnectPhase {
    fn describe(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connect",
            Self::HandshakeGreeting => "greeting",
            Self::HandshakeAuthAck => "authentication",
            Self::HandshakeConnectRequest => "connect request",
            Self::HandshakeConnectReply => "connect reply",
            Self::Established => "transfer",
            Self::Exhausted => "shutdown",
        }
    }

    fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Established | Self::Exhausted)
    }
}

/// Event fed into the connector by its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectInput<'a> {
    Start,
    /// The socket opened by the last `OpenSocket` is connected
    Connected,
    /// The last `Send` was written out completely
    Flushed,
    Data(&'a [u8]),
    /// The armed timer expired
    Timeout,
    /// Remote closed the socket
    Hangup,
    Error(String),
}

/// Command for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutput {
    OpenSocket { index: usize, host: String, port: u16 },
    ArmTimer { index: usize, duration: Duration },
    DisarmTimer { index: usize },
    Send { index: usize, bytes: Vec<u8> },
    CloseSocket { index: usize },
    CandidateFailed { index: usize, reason: String },
    /// Handshake done; `leftover` is anything read past the reply
    Established { index: usize, leftover: Vec<u8> },
    Exhausted { reason: String },
}

enum ReplyStatus {
    Pending,
    Accepted,
    Rejected(String),
}

/// Client side of the SOCKS5 handshake over an ordered candidate list.
///
/// At most one socket and one timer are live at any time. Every attempt arms
/// the timer while connecting and again while waiting for each handshake
/// reply; any failure closes the socket, reports the candidate and moves on.
pub struct Socks5Connector {
    candidates: Vec<Candidate>,
    digest: String,
    timeout: Duration,
    index: usize,
    phase: ConnectPhase,
    lookahead: LookAhead,
    socket_open: bool,
    timer_armed: bool,
    last_error: Option<String>,
}

impl Socks5Connector {
    pub fn new(candidates: Vec<Candidate>, digest: &str, timeout: Duration) -> Self {
        Self {
            candidates,
            digest: digest.to_string(),
            timeout,
            index: 0,
            phase: ConnectPhase::Idle,
            lookahead: LookAhead::default(),
            socket_open: false,
            timer_armed: false,
            last_error: None,
        }
    }

    pub fn phase(&self) -> ConnectPhase {
        self.phase
    }

    /// Index of the candidate currently being tried.
    pub fn current(&self) -> usize {
        self.index
    }

    pub fn step(&mut self, input: ConnectInput<'_>) -> Vec<ConnectOutput> {
        let mut out = Vec::new();
        let failure = match (self.phase, input) {
            (ConnectPhase::Idle, ConnectInput::Start) => {
                self.open_next(&mut out);
                None
            }
            (ConnectPhase::Connecting, ConnectInput::Connected) => {
                self.disarm(&mut out);
                out.push(ConnectOutput::Send {
                    index: self.index,
                    bytes: vec![SOCKS_VERSION, 1, METHOD_NO_AUTH],
                });
                self.phase = ConnectPhase::HandshakeGreeting;
                None
            }
            (ConnectPhase::HandshakeGreeting, ConnectInput::Flushed) => {
                self.arm(&mut out);
                self.phase = ConnectPhase::HandshakeAuthAck;
                None
            }
            (ConnectPhase::HandshakeAuthAck, ConnectInput::Data(bytes)) => {
                match self.lookahead.push(bytes) {
                    Err(e) => Some(e),
                    Ok(()) => match self.lookahead.take_exact(2) {
                        None => None,
                        Some(ack) if ack == [SOCKS_VERSION, METHOD_NO_AUTH] => {
                            self.disarm(&mut out);
                            out.push(ConnectOutput::Send {
                                index: self.index,
                                bytes: connect_request(&self.digest),
                            });
                            self.phase = ConnectPhase::HandshakeConnectRequest;
                            None
                        }
                        Some(ack) => Some(format!(
                            "authentication not accepted (version {}, method {})",
                            ack[0], ack[1]
                        )),
                    },
                }
            }
            (ConnectPhase::HandshakeConnectRequest, ConnectInput::Flushed) => {
                self.arm(&mut out);
                self.phase = ConnectPhase::HandshakeConnectReply;
                None
            }
            (ConnectPhase::HandshakeConnectReply, ConnectInput::Data(bytes)) => {
                match self.lookahead.push(bytes) {
                    Err(e) => Some(e),
                    Ok(()) => match self.check_reply() {
                        ReplyStatus::Pending => None,
                        ReplyStatus::Rejected(reason) => Some(reason),
                        ReplyStatus::Accepted => {
                            self.disarm(&mut out);
                            self.phase = ConnectPhase::Established;
                            out.push(ConnectOutput::Established {
                                index: self.index,
                                leftover: self.lookahead.take_all(),
                            });
                            None
                        }
                    },
                }
            }
            (phase, ConnectInput::Timeout) if phase.is_active() => {
                // The timer fired, nothing left to disarm
                self.timer_armed = false;
                Some(format!(
                    "{} timed out after {}s",
                    phase.describe(),
                    self.timeout.as_secs()
                ))
            }
            (phase, ConnectInput::Hangup) if phase.is_active() => Some(format!(
                "streamhost closed the connection during {}",
                phase.describe()
            )),
            (phase, ConnectInput::Error(e)) if phase.is_active() => Some(e),
            _ => None,
        };
        if let Some(reason) = failure {
            self.fail_candidate(reason, &mut out);
        }
        out
    }

    fn check_reply(&mut self) -> ReplyStatus {
        let head = self.lookahead.peek();
        if head.len() < 4 {
            return ReplyStatus::Pending;
        }
        if head[0] != SOCKS_VERSION {
            return ReplyStatus::Rejected(format!("unexpected SOCKS version {}", head[0]));
        }
        if head[1] != 0 {
            return ReplyStatus::Rejected(reply_code_text(head[1]).to_string());
        }
        let needed = match head[3] {
            ATYP_IPV4 => 4 + 4 + 2,
            ATYP_IPV6 => 4 + 16 + 2,
            ATYP_DOMAIN => {
                if head.len() < 5 {
                    return ReplyStatus::Pending;
                }
                5 + head[4] as usize + 2
            }
            // Some proxies answer with a bare header; nothing else follows
            // before activation, so take what arrived.
            0 => head.len(),
            other => {
                return ReplyStatus::Rejected(format!("unknown address type {} in reply", other))
            }
        };
        let Some(reply) = self.lookahead.take_exact(needed) else {
            return ReplyStatus::Pending;
        };
        // A domain-form reply names the stream it connected; it has to be ours.
        if reply[3] == ATYP_DOMAIN && &reply[5..needed - 2] != self.digest.as_bytes() {
            return ReplyStatus::Rejected(format!(
                "streamhost connected a different destination '{}'",
                String::from_utf8_lossy(&reply[5..needed - 2])
            ));
        }
        ReplyStatus::Accepted
    }

    fn arm(&mut self, out: &mut Vec<ConnectOutput>) {
        if !self.timer_armed {
            self.timer_armed = true;
            out.push(ConnectOutput::ArmTimer {
                index: self.index,
                duration: self.timeout,
            });
        }
    }

    fn disarm(&mut self, out: &mut Vec<ConnectOutput>) {
        if self.timer_armed {
            self.timer_armed = false;
            out.push(ConnectOutput::DisarmTimer { index: self.index });
        }
    }

    fn fail_candidate(&mut self, reason: String, out: &mut Vec<ConnectOutput>) {
        self.disarm(out);
        if self.socket_open {
            self.socket_open = false;
            out.push(ConnectOutput::CloseSocket { index: self.index });
        }
        out.push(ConnectOutput::CandidateFailed {
            index: self.index,
            reason: reason.clone(),
        });
        self.last_error = Some(reason);
        self.index += 1;
        self.open_next(out);
    }

    /// Open the next usable candidate, skipping unusable entries in a loop.
    fn open_next(&mut self, out: &mut Vec<ConnectOutput>) {
        self.lookahead.clear();
        loop {
            let Some(candidate) = self.candidates.get(self.index) else {
                self.phase = ConnectPhase::Exhausted;
                let reason = match &self.last_error {
                    Some(e) => format!("couldn't connect to any streamhost (last error: {})", e),
                    None => "no streamhosts to try".to_string(),
                };
                out.push(ConnectOutput::Exhausted { reason });
                return;
            };
            if candidate.host.is_empty() || candidate.port == 0 {
                let reason = format!("invalid streamhost address {}:{}", candidate.host, candidate.port);
                out.push(ConnectOutput::CandidateFailed {
                    index: self.index,
                    reason: reason.clone(),
                });
                self.last_error = Some(reason);
                self.index += 1;
                continue;
            }
            out.push(ConnectOutput::OpenSocket {
                index: self.index,
                host: candidate.host.clone(),
                port: candidate.port,
            });
            self.socket_open = true;
            self.phase = ConnectPhase::Connecting;
            self.arm(out);
            return;
        }
    }
}

/// Result of feeding bytes to the acceptor.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AcceptProgress {
    /// Bytes to write back to the connecting peer
    pub reply: Vec<u8>,
    /// The peer asked for our address; bytes after its request
    pub established: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptPhase {
    Greeting,
    Request,
    Established,
}

/// Streamhost side: accepts a no-auth greeting and a CONNECT to `digest`.
pub struct Socks5Acceptor {
    digest: String,
    phase: AcceptPhase,
    lookahead: LookAhead,
}

impl Socks5Acceptor {
    pub fn new(digest: &str) -> Self {
        Self {
            digest: digest.to_string(),
            phase: AcceptPhase::Greeting,
            lookahead: LookAhead::default(),
        }
    }

    pub fn on_data(&mut self, bytes: &[u8]) -> Result<AcceptProgress, String> {
        self.lookahead.push(bytes)?;
        let mut progress = AcceptProgress::default();
        loop {
            match self.phase {
                AcceptPhase::Greeting => {
                    let head = self.lookahead.peek();
                    if head.len() < 2 {
                        return Ok(progress);
                    }
                    let (version, nmethods) = (head[0], head[1] as usize);
                    if version != SOCKS_VERSION || !(1..=32).contains(&nmethods) {
                        return Err(format!(
                            "invalid greeting (version {}, {} methods)",
                            version, nmethods
                        ));
                    }
                    let Some(greeting) = self.lookahead.take_exact(2 + nmethods) else {
                        return Ok(progress);
                    };
                    if !greeting[2..].contains(&METHOD_NO_AUTH) {
                        return Err("peer does not offer unauthenticated access".to_string());
                    }
                    progress.reply.extend_from_slice(&[SOCKS_VERSION, METHOD_NO_AUTH]);
                    self.phase = AcceptPhase::Request;
                }
                AcceptPhase::Request => {
                    let Some(request) = self.lookahead.take_exact(7 + DIGEST_HEX_LEN) else {
                        return Ok(progress);
                    };
                    if request[0] != SOCKS_VERSION
                        || request[1] != CMD_CONNECT
                        || request[3] != ATYP_DOMAIN
                        || request[4] as usize != DIGEST_HEX_LEN
                    {
                        return Err("unsupported CONNECT request".to_string());
                    }
                    if &request[5..5 + DIGEST_HEX_LEN] != self.digest.as_bytes() {
                        return Err("CONNECT request for an unknown stream".to_string());
                    }
                    // Reply mirrors the request with a success code
                    let mut reply = request;
                    reply[1] = 0;
                    progress.reply.extend_from_slice(&reply);
                    self.phase = AcceptPhase::Established;
                    progress.established = Some(self.lookahead.take_all());
                    return Ok(progress);
                }
                AcceptPhase::Established => return Ok(progress),
            }
        }
    }
}
