//! SASL (DIGEST-MD5, PLAIN) and legacy `jabber:iq:auth` credentials.

use std::collections::HashMap;

use base64::prelude::*;
use md5::{Digest as _, Md5};
use sha1::Sha1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    DigestMd5,
    Plain,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Self::DigestMd5 => "DIGEST-MD5",
            Self::Plain => "PLAIN",
        }
    }
}

/// Pick the strongest mechanism we support from the server's offer.
pub fn choose_mechanism<'a>(offered: impl IntoIterator<Item = &'a str>) -> Option<Mechanism> {
    let mut plain = false;
    for m in offered {
        if m.trim().eq_ignore_ascii_case("DIGEST-MD5") {
            return Some(Mechanism::DigestMd5);
        }
        if m.trim().eq_ignore_ascii_case("PLAIN") {
            plain = true;
        }
    }
    plain.then_some(Mechanism::Plain)
}

/// Initial response for PLAIN: base64 of `\0user\0password`.
pub fn plain_initial(username: &str, password: &str) -> String {
    let mut raw = Vec::with_capacity(username.len() + password.len() + 2);
    raw.push(0);
    raw.extend_from_slice(username.as_bytes());
    raw.push(0);
    raw.extend_from_slice(password.as_bytes());
    BASE64_STANDARD.encode(raw)
}

/// Parse a decoded challenge of `key=value` pairs. Values may be quoted,
/// with backslash escapes; keys are folded to lowercase.
pub fn parse_challenge(challenge: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut chars = challenge.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if key.is_empty() {
            return fields;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        }
        while let Some(&c) = chars.peek() {
            if c == ',' {
                break;
            }
            value.push(c);
            chars.next();
        }
        fields.insert(key.trim().to_ascii_lowercase(), value);
    }
}

/// What to send back for a `<challenge/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeReply {
    /// Base64 response text
    Response(String),
    /// Server proved itself with `rspauth`; answer with an empty response
    Empty,
}

/// Answer a base64 DIGEST-MD5 challenge.
///
/// `server` is the account domain, used for the digest URI and as realm when
/// the challenge names none. `cnonce` is the client nonce to use.
pub fn digest_md5_reply(
    challenge_b64: &str,
    username: &str,
    password: &str,
    server: &str,
    cnonce: &str,
) -> Result<ChallengeReply, String> {
    let decoded = BASE64_STANDARD
        .decode(challenge_b64.trim())
        .map_err(|e| format!("challenge is not base64: {}", e))?;
    let decoded = String::from_utf8_lossy(&decoded);
    let fields = parse_challenge(&decoded);
    if fields.contains_key("rspauth") {
        return Ok(ChallengeReply::Empty);
    }
    let nonce = fields
        .get("nonce")
        .ok_or_else(|| "challenge has no nonce".to_string())?;
    let realm = fields.get("realm").map(String::as_str).unwrap_or(server);
    let digest_uri = format!("xmpp/{}", server);

    let h = Md5::digest(format!("{}:{}:{}", username, realm, password).as_bytes());
    let mut a1 = Md5::new();
    a1.update(h);
    a1.update(format!(":{}:{}", nonce, cnonce).as_bytes());
    let a1 = hex::encode(a1.finalize());
    let a2 = hex::encode(Md5::digest(format!("AUTHENTICATE:{}", digest_uri).as_bytes()));
    let response = hex::encode(Md5::digest(
        format!("{}:{}:00000001:{}:auth:{}", a1, nonce, cnonce, a2).as_bytes(),
    ));

    let text = format!(
        "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc=00000001,qop=auth,\
         digest-uri=\"{}\",response={},charset=utf-8",
        username, realm, nonce, cnonce, digest_uri, response
    );
    Ok(ChallengeReply::Response(BASE64_STANDARD.encode(text)))
}

/// Fresh client nonce: 30 random bytes, base64.
pub fn new_cnonce() -> String {
    let bytes: [u8; 30] = rand::random();
    BASE64_STANDARD.encode(bytes)
}

/// Legacy digest: SHA-1 hex of stream id followed by the password.
pub fn legacy_digest(stream_id: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_prefers_digest() {
        assert_eq!(
            choose_mechanism(["PLAIN", "DIGEST-MD5", "SCRAM-SHA-1"]),
            Some(Mechanism::DigestMd5)
        );
        assert_eq!(choose_mechanism(["plain"]), Some(Mechanism::Plain));
        assert_eq!(choose_mechanism(["SCRAM-SHA-1"]), None);
    }

    #[test]
    fn test_plain_initial() {
        assert_eq!(plain_initial("alice", "secret"), "AGFsaWNlAHNlY3JldA==");
    }

    #[test]
    fn test_parse_challenge_quotes_and_escapes() {
        let fields = parse_challenge(
            "realm=\"example.org\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",charset=utf-8,algorithm=md5-sess,x=\"a\\\"b,c\"",
        );
        assert_eq!(fields["realm"], "example.org");
        assert_eq!(fields["nonce"], "OA6MG9tEQGm2hh");
        assert_eq!(fields["charset"], "utf-8");
        assert_eq!(fields["algorithm"], "md5-sess");
        assert_eq!(fields["x"], "a\"b,c");
    }

    #[test]
    fn test_digest_md5_known_answer() {
        // RFC 2831 example values, with the XMPP digest URI
        let challenge = BASE64_STANDARD.encode(
            "realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",algorithm=md5-sess,charset=utf-8",
        );
        let reply = digest_md5_reply(
            &challenge,
            "chris",
            "secret",
            "elwood.innosoft.com",
            "OA6MHXh6VqTrRk",
        )
        .unwrap();
        let ChallengeReply::Response(b64) = reply else {
            panic!("expected a response");
        };
        let text = String::from_utf8(BASE64_STANDARD.decode(b64).unwrap()).unwrap();
        let fields = parse_challenge(&text);
        assert_eq!(fields["username"], "chris");
        assert_eq!(fields["realm"], "elwood.innosoft.com");
        assert_eq!(fields["digest-uri"], "xmpp/elwood.innosoft.com");
        assert_eq!(fields["nc"], "00000001");
        assert_eq!(fields["response"].len(), 32);

        // Same inputs, same answer
        let again = digest_md5_reply(
            &challenge,
            "chris",
            "secret",
            "elwood.innosoft.com",
            "OA6MHXh6VqTrRk",
        )
        .unwrap();
        assert_eq!(again, ChallengeReply::Response(BASE64_STANDARD.encode(&text)));
    }

    #[test]
    fn test_digest_md5_defaults_realm_and_handles_rspauth() {
        let challenge = BASE64_STANDARD.encode("nonce=\"abc\",qop=\"auth\"");
        let ChallengeReply::Response(b64) =
            digest_md5_reply(&challenge, "alice", "pw", "example.org", "cn").unwrap()
        else {
            panic!("expected a response");
        };
        let text = String::from_utf8(BASE64_STANDARD.decode(b64).unwrap()).unwrap();
        assert!(text.contains("realm=\"example.org\""));

        let rspauth = BASE64_STANDARD.encode("rspauth=ea40f60335c427b5527b84dbabcdfffd");
        assert_eq!(
            digest_md5_reply(&rspauth, "alice", "pw", "example.org", "cn").unwrap(),
            ChallengeReply::Empty
        );
        assert!(digest_md5_reply("!!!", "alice", "pw", "example.org", "cn").is_err());
        let no_nonce = BASE64_STANDARD.encode("realm=\"x\"");
        assert!(digest_md5_reply(&no_nonce, "alice", "pw", "example.org", "cn").is_err());
    }

    #[test]
    fn test_legacy_digest() {
        // sha1("3EE948B0" + "Calli0pe")
        assert_eq!(
            legacy_digest("3EE948B0", "Calli0pe"),
            "48fc78be9ec8f86d8ce1c39c320c97c21d62334d"
        );
    }
}
