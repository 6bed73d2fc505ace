//! Raw DNS message view.
//!
//! Nothing here decodes a full message: the proxy only needs the header, the
//! first question and the TTL of the answers, so every accessor walks the
//! bytes it needs straight out of the buffer.

use std::net::Ipv4Addr;
use std::sync::OnceLock;
use thiserror::Error;

pub const HEADER_LEN: usize = 12;

/// Largest datagram the proxy reads, in either direction.
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Z bit in the second flags byte, flipped on everything we relay.
pub const MARKER_BIT: u8 = 0x40;

/// TTL of the answer in a spoofed response.
pub const SPOOF_TTL: u32 = 120;

// Respuesta estándar, RD + RA, con el bit Z puesto.
const SPOOF_FLAGS: u16 = 0x81c0;
const TYPE_CLASS_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("paquete de {0} bytes no puede ser DNS, necesita más de {HEADER_LEN}")]
    TooShort(usize),

    #[error("sección de consulta truncada: termina en {end}, el paquete tiene {len} bytes")]
    TruncatedQuery { end: usize, len: usize },
}

/// One DNS message backed by `B`.
///
/// The storage is generic so an inbound request can stay in its pooled
/// receive buffer while cache entries own a `Vec<u8>`.
#[derive(Clone)]
pub struct Packet<B = Vec<u8>> {
    raw: B,
    domain: OnceLock<String>,
}

impl<B: AsRef<[u8]>> Packet<B> {
    pub fn parse(raw: B) -> Result<Self, PacketError> {
        let len = raw.as_ref().len();
        if len <= HEADER_LEN {
            return Err(PacketError::TooShort(len));
        }
        Ok(Self {
            raw,
            domain: OnceLock::new(),
        })
    }

    pub fn raw(&self) -> &[u8] {
        self.raw.as_ref()
    }

    pub fn into_inner(self) -> B {
        self.raw
    }

    pub fn id(&self) -> u16 {
        let raw = self.raw();
        u16::from_be_bytes([raw[0], raw[1]])
    }

    pub fn flags(&self) -> u16 {
        let raw = self.raw();
        u16::from_be_bytes([raw[2], raw[3]])
    }

    pub fn questions(&self) -> u16 {
        let raw = self.raw();
        u16::from_be_bytes([raw[4], raw[5]])
    }

    /// Name of the first question.
    ///
    /// Every byte of the encoded name below `'0'` is turned into a `.`, which
    /// covers the label length bytes but also `-` and friends. Matching against
    /// the blocklists is done on this form.
    pub fn domain(&self) -> &str {
        self.domain.get_or_init(|| self.decode_domain())
    }

    /// All queried names. Only the first question is ever read.
    pub fn domains(&self) -> &[String] {
        std::slice::from_ref(self.domain.get_or_init(|| self.decode_domain()))
    }

    fn decode_domain(&self) -> String {
        if self.questions() > 1 {
            tracing::warn!(
                id = self.id(),
                questions = self.questions(),
                "paquete con varias preguntas, sólo se atiende la primera"
            );
        }

        let raw = self.raw();
        let start = HEADER_LEN + 1;
        let end = (HEADER_LEN + self.name_len()).min(raw.len());
        if end <= start {
            return String::new();
        }

        let bytes: Vec<u8> = raw[start..end]
            .iter()
            .map(|&b| if b < b'0' { b'.' } else { b })
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Offset of the terminal zero of the first name, relative to the header.
    fn name_len(&self) -> usize {
        let raw = self.raw();
        let mut i = HEADER_LEN;
        while i < raw.len() && raw[i] != 0 {
            i += raw[i] as usize + 1;
        }
        i - HEADER_LEN
    }

    fn query_end(&self) -> usize {
        HEADER_LEN + self.name_len() + 1 + TYPE_CLASS_LEN
    }

    /// The first question: encoded name, terminal zero, type and class.
    pub fn query(&self) -> Result<&[u8], PacketError> {
        let raw = self.raw();
        let end = self.query_end();
        if end > raw.len() {
            return Err(PacketError::TruncatedQuery {
                end,
                len: raw.len(),
            });
        }
        Ok(&raw[HEADER_LEN..end])
    }

    /// Everything after the first question, as opaque bytes.
    pub fn additional_records(&self) -> &[u8] {
        let raw = self.raw();
        &raw[self.query_end().min(raw.len())..]
    }

    fn first_answer(&self) -> Option<usize> {
        let start = self.query_end();
        (start < self.raw().len()).then_some(start)
    }

    /// TTL of the first answer, or 0 when there is none.
    ///
    /// Answers are assumed to start with a two byte compressed name.
    pub fn ttl(&self) -> u32 {
        let raw = self.raw();
        match self.first_answer() {
            Some(i) if i + 10 <= raw.len() => {
                u32::from_be_bytes([raw[i + 6], raw[i + 7], raw[i + 8], raw[i + 9]])
            }
            _ => 0,
        }
    }

    /// Independently owned duplicate.
    pub fn copy(&self) -> Packet<Vec<u8>> {
        Packet {
            raw: self.raw().to_vec(),
            domain: self.domain.clone(),
        }
    }

    /// Builds the fabricated answer served for a hard-blocked name.
    ///
    /// ID, question and additional records are echoed from the request; a
    /// single A-shaped answer points back at the question name.
    pub fn spoof(&self, address: Ipv4Addr) -> Result<Vec<u8>, PacketError> {
        let raw = self.raw();
        let query = self.query()?;
        let type_class = &query[query.len() - TYPE_CLASS_LEN..];
        let additional = self.additional_records();

        let mut out = Vec::with_capacity(HEADER_LEN + query.len() + 16 + additional.len());
        out.extend_from_slice(&raw[0..2]);
        out.extend_from_slice(&SPOOF_FLAGS.to_be_bytes());
        out.extend_from_slice(&raw[4..6]); // QDCOUNT
        out.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
        // ARCOUNT del pedido, no un 1 fijo: la cola adicional se copia tal cual.
        out.extend_from_slice(&raw[10..12]);
        out.extend_from_slice(query);
        out.extend_from_slice(&[0xc0, 0x0c]);
        out.extend_from_slice(type_class);
        out.extend_from_slice(&SPOOF_TTL.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&address.octets());
        out.extend_from_slice(additional);
        Ok(out)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Packet<B> {
    pub fn set_id(&mut self, id: u16) {
        self.raw.as_mut()[0..2].copy_from_slice(&id.to_be_bytes());
    }

    /// Rewrites the TTL of every record reachable after the question.
    pub fn set_ttl(&mut self, ttl: u32) {
        let mut next = self.first_answer();
        let raw = self.raw.as_mut();
        let len = raw.len();

        while let Some(i) = next {
            if i + 10 > len {
                break;
            }
            raw[i + 6..i + 10].copy_from_slice(&ttl.to_be_bytes());
            if i + 12 > len {
                break;
            }
            let rdlen = u16::from_be_bytes([raw[i + 10], raw[i + 11]]) as usize;
            let following = i + 12 + rdlen;
            next = (following < len).then_some(following);
        }
    }

    pub fn toggle_marker(&mut self) {
        self.raw.as_mut()[3] ^= MARKER_BIT;
    }
}

impl<B: AsRef<[u8]>> std::fmt::Debug for Packet<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id())
            .field("len", &self.raw().len())
            .field("domain", &self.domain())
            .finish()
    }
}

/// `google.com A` with an EDNS OPT record, as sent by `dig`.
pub const GOOGLE_QUERY: [u8; 51] = [
    0x24, 0x58, 0x01, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // header
    0x06, b'g', b'o', b'o', b'g', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, // name
    0x00, 0x01, 0x00, 0x01, // A IN
    0x00, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0c, // OPT
    0x00, 0x0a, 0x00, 0x08, 0xf2, 0xf4, 0x43, 0x16, 0x0c, 0x5a, 0x67, 0x51, // cookie
];
