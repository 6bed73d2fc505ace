//! Domain blocklists.
//!
//! A list maps an exact domain name to an optional address to answer with.
//! Sources are plain text, one entry per line, either a bare name or a
//! hosts-file style `<ipv4> <name>` pair.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlocklistError {
    #[error("no pude descargar {uri}")]
    Fetch {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("no pude leer {uri}")]
    Read {
        uri: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocklist {
    entries: HashMap<String, Option<Ipv4Addr>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads one source: `http*` URIs are fetched, anything else is a path.
    pub async fn load(uri: &str) -> Result<Self, BlocklistError> {
        let body = if uri.starts_with("http") {
            fetch(uri).await?
        } else {
            tokio::fs::read(uri)
                .await
                .map_err(|source| BlocklistError::Read {
                    uri: uri.to_string(),
                    source,
                })?
        };

        let list = Self::parse(&String::from_utf8_lossy(&body));
        tracing::debug!(uri, entries = list.len(), "blocklist cargada");
        Ok(list)
    }

    /// Loads every source in order and merges them. Any failing source fails
    /// the whole load.
    pub async fn load_all<S: AsRef<str>>(uris: &[S]) -> Result<Self, BlocklistError> {
        let mut all = Vec::with_capacity(uris.len());
        for uri in uris {
            all.push(Self::load(uri.as_ref()).await?);
        }
        Ok(Self::merge(all))
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let (Some(first), second) = (tokens.next(), tokens.next()) else {
                continue;
            };

            match second {
                Some(name) => {
                    // sólo IPv4; cualquier otra cosa se descarta
                    let Ok(address) = first.parse::<Ipv4Addr>() else {
                        continue;
                    };
                    entries.insert(name.to_string(), Some(address));
                }
                None => {
                    entries.insert(first.to_string(), None);
                }
            }
        }

        Self { entries }
    }

    /// Adds every entry of `others` in order; later lists win on duplicates.
    pub fn coalesce<I>(&mut self, others: I)
    where
        I: IntoIterator<Item = Blocklist>,
    {
        for other in others {
            self.entries.extend(other.entries);
        }
    }

    pub fn merge(all: Vec<Blocklist>) -> Self {
        let mut iter = all.into_iter();
        let mut merged = iter.next().unwrap_or_default();
        merged.coalesce(iter);
        merged
    }

    pub fn blocked(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Address configured for `name`, if it is listed with one.
    pub fn address_for(&self, name: &str) -> Option<Ipv4Addr> {
        self.entries.get(name).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Option<Ipv4Addr>)> for Blocklist {
    fn from_iter<T: IntoIterator<Item = (S, Option<Ipv4Addr>)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

async fn fetch(uri: &str) -> Result<Vec<u8>, BlocklistError> {
    let wrap = |source| BlocklistError::Fetch {
        uri: uri.to_string(),
        source,
    };

    let resp = reqwest::get(uri)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(wrap)?;
    let body = resp.bytes().await.map_err(wrap)?;
    Ok(body.to_vec())
}
