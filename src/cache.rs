//! Outstanding request tracking.
//!
//! Requests sent through [`CorrelationCache::track`] are stamped with an id
//! derived from a per-session secret and a counter, so a reply can be told
//! apart from anything a peer might invent. Replies are routed back to the
//! resolver registered for their id; ids with our tracked prefix but no live
//! entry are dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::xmltree::{Element, HandlerStatus};

/// Prefix of ids we expect a reply for.
pub const TRACKED_PREFIX: &str = "jgT";

/// Prefix of ids for fire-and-forget requests.
pub const UNTRACKED_PREFIX: &str = "jgE";

/// Hex digits of the hash kept in tracked ids.
const TRACKED_HASH_LEN: usize = 16;

/// Continuation run when the reply to a tracked request arrives. Receives
/// the session context, the reply and the original request.
pub type Resolver<C> = Box<dyn FnOnce(&mut C, &Element, &Element) -> HandlerStatus + Send>;

struct Entry<C> {
    request: Element,
    resolver: Resolver<C>,
    sent_at: Instant,
}

/// Outcome of looking up an inbound reply id.
pub enum Route<C> {
    /// Not one of ours, hand the stanza on
    PassThrough,
    /// Live entry, already removed from the cache
    Hit {
        request: Element,
        resolver: Resolver<C>,
    },
    /// Tracked prefix but unknown or expired
    Drop,
}

pub struct CorrelationCache<C> {
    secret: [u8; 16],
    counter: u64,
    untracked_counter: u64,
    entries: HashMap<String, Entry<C>>,
}

impl<C> CorrelationCache<C> {
    pub fn new() -> Self {
        Self::with_secret(rand::random())
    }

    pub fn with_secret(secret: [u8; 16]) -> Self {
        Self {
            secret,
            counter: 0,
            untracked_counter: 0,
            entries: HashMap::new(),
        }
    }

    /// Stamp `request` with a fresh tracked id and remember it. Returns the
    /// stamped request, ready to serialize.
    pub fn track(&mut self, mut request: Element, resolver: Resolver<C>, now: Instant) -> Element {
        self.counter += 1;
        let mut hasher = Sha1::new();
        hasher.update(self.secret);
        hasher.update(self.counter.to_be_bytes());
        let digest = hex::encode(hasher.finalize());
        let id = format!("{}{}", TRACKED_PREFIX, &digest[..TRACKED_HASH_LEN]);

        request.set_attr("id", id.as_str());
        trace!(id = %id, name = request.name(), "tracking request");
        self.entries.insert(
            id,
            Entry {
                request: request.clone(),
                resolver,
                sent_at: now,
            },
        );
        request
    }

    /// Id for a request whose reply nobody waits for.
    pub fn untracked_id(&mut self) -> String {
        self.untracked_counter += 1;
        format!("{}{}", UNTRACKED_PREFIX, self.untracked_counter)
    }

    /// Look up the entry for an inbound reply id. A hit is removed before
    /// the caller runs its resolver, so each resolver fires at most once.
    pub fn route(&mut self, id: Option<&str>) -> Route<C> {
        let Some(id) = id else {
            return Route::PassThrough;
        };
        if !id.starts_with(TRACKED_PREFIX) {
            return Route::PassThrough;
        }
        match self.entries.remove(id) {
            Some(entry) => Route::Hit {
                request: entry.request,
                resolver: entry.resolver,
            },
            None => {
                debug!(id = %id, "dropping reply to unknown or expired request");
                Route::Drop
            }
        }
    }

    /// Forget entries older than `max_age`. Returns the ids that expired so
    /// whoever waited on them can give up.
    pub fn sweep(&mut self, now: Instant, max_age: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        if !expired.is_empty() {
            debug!(
                dropped = expired.len(),
                remaining = self.entries.len(),
                "expired tracked requests"
            );
        }
        expired
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C> Default for CorrelationCache<C> {
    fn default() -> Self {
        Self::new()
    }
}
