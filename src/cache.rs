use crate::clock::Clock;
use crate::packet::Packet;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

struct CachedEntry {
    packet: Packet,
    expires_at: Instant,
}

/// TTL-bound store of upstream replies.
///
/// Entries are keyed by the queried name plus the raw additional records, so
/// two queries differing only in their EDNS data do not share an entry.
/// Expired entries are never swept; they read as misses until overwritten.
pub struct ResponseCache {
    entries: RwLock<HashMap<Vec<u8>, CachedEntry>>,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn fetch<B: AsRef<[u8]>>(&self, query: &Packet<B>) -> Option<Packet> {
        let now = self.clock.now();
        let Ok(entries) = self.entries.read() else {
            return None;
        };
        let entry = entries.get(&cache_key(query))?;
        if entry.expires_at < now {
            return None;
        }
        Some(entry.packet.clone())
    }

    /// Keeps a copy of `response` under its own key.
    pub fn store<B: AsRef<[u8]>>(&self, response: &Packet<B>) {
        self.insert(cache_key(response), response);
    }

    /// Keeps a copy of `response` under the key of the query that produced it.
    pub fn store_reply<Q, R>(&self, query: &Packet<Q>, response: &Packet<R>)
    where
        Q: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        self.insert(cache_key(query), response);
    }

    fn insert<B: AsRef<[u8]>>(&self, key: Vec<u8>, response: &Packet<B>) {
        let entry = CachedEntry {
            packet: response.copy(),
            expires_at: self.clock.now() + Duration::from_secs(response.ttl().into()),
        };

        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cache_key<B: AsRef<[u8]>>(packet: &Packet<B>) -> Vec<u8> {
    let domain = packet.domain().as_bytes();
    let additional = packet.additional_records();
    let mut key = Vec::with_capacity(domain.len() + additional.len());
    key.extend_from_slice(domain);
    key.extend_from_slice(additional);
    key
}
