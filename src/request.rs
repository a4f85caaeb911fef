use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Length of the fixed URL key. The first [`HOST_HASH_OFFSET`] bytes identify
/// the URL itself, the remaining bytes identify the host, so the host hash can
/// be sliced out of any URL hash without re-parsing the URL.
pub const URL_HASH_LEN: usize = 12;
pub const HOST_HASH_LEN: usize = 6;
const HOST_HASH_OFFSET: usize = URL_HASH_LEN - HOST_HASH_LEN;

/// Primary key of a pending request, unique across the whole frontier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct UrlHash(pub [u8; URL_HASH_LEN]);

/// Shard key identifying one host (host name + effective port).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct HostHash(pub [u8; HOST_HASH_LEN]);

impl UrlHash {
    /// Derive the key for a URL. The host digest lands in the tail bytes so
    /// all URLs of one host share the same suffix.
    pub fn from_url(url: &Url) -> Self {
        let host_hash = HostHash::from_url(url);
        let digest = Sha256::digest(url.as_str().as_bytes());
        let mut hash = [0u8; URL_HASH_LEN];
        hash[..HOST_HASH_OFFSET].copy_from_slice(&digest[..HOST_HASH_OFFSET]);
        hash[HOST_HASH_OFFSET..].copy_from_slice(&host_hash.0);
        Self(hash)
    }

    /// The host shard this URL belongs to.
    pub fn host_hash(&self) -> HostHash {
        let mut h = [0u8; HOST_HASH_LEN];
        h.copy_from_slice(&self.0[HOST_HASH_OFFSET..]);
        HostHash(h)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl HostHash {
    /// Digest of `host:port`, using the scheme-default port when the URL
    /// carries none.
    pub fn from_url(url: &Url) -> Self {
        let host = url.host_str().unwrap_or("localhost");
        let port = url.port_or_known_default().unwrap_or(80);
        Self::from_host_port(host, port)
    }

    pub fn from_host_port(host: &str, port: u16) -> Self {
        let digest = Sha256::digest(format!("{}:{}", host.to_lowercase(), port).as_bytes());
        let mut h = [0u8; HOST_HASH_LEN];
        h.copy_from_slice(&digest[..HOST_HASH_LEN]);
        Self(h)
    }

    /// Hex form used for shard file names.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(HOST_HASH_LEN * 2);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != HOST_HASH_LEN * 2 {
            return None;
        }
        let mut h = [0u8; HOST_HASH_LEN];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            h[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Self(h))
    }
}

/// One pending fetch. Immutable once constructed; persisted on push and
/// removed exactly once by a successful pop or a bulk remove.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct Request {
    pub url_hash: UrlHash,
    pub url: String,
    pub depth: u16,
    pub profile_handle: String,
    pub referrer_hash: Option<UrlHash>,
    pub initiator_hash: Option<UrlHash>,
    /// UNIX millis when the link was discovered.
    pub appdate: u64,
}

impl Request {
    pub fn new(
        url: Url,
        depth: u16,
        profile_handle: String,
        referrer_hash: Option<UrlHash>,
        initiator_hash: Option<UrlHash>,
    ) -> Self {
        let url_hash = UrlHash::from_url(&url);
        let appdate = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            url_hash,
            url: url.into(),
            depth,
            profile_handle,
            referrer_hash,
            initiator_hash,
            appdate,
        }
    }

    pub fn host_hash(&self) -> HostHash {
        self.url_hash.host_hash()
    }

    /// Re-parse the stored URL. Entries are only admitted with valid URLs, so
    /// a failure here indicates a corrupt row.
    pub fn parsed_url(&self) -> Option<Url> {
        Url::parse(&self.url).ok()
    }

    /// Clear-text `host:port` label used for operator-facing listings.
    pub fn host_label(&self) -> Option<String> {
        let url = self.parsed_url()?;
        let host = url.host_str()?.to_lowercase();
        let port = url.port_or_known_default().unwrap_or(80);
        Some(format!("{}:{}", host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(url: &str) -> Request {
        Request::new(Url::parse(url).unwrap(), 0, "p".to_string(), None, None)
    }

    #[test]
    fn test_host_hash_embedded_in_url_hash() {
        let a = req("http://a.example/one");
        let b = req("http://a.example/two");
        assert_ne!(a.url_hash, b.url_hash);
        assert_eq!(a.host_hash(), b.host_hash());
    }

    #[test]
    fn test_different_hosts_differ() {
        let a = req("http://a.example/one");
        let b = req("http://b.example/one");
        assert_ne!(a.host_hash(), b.host_hash());
    }

    #[test]
    fn test_port_is_part_of_host_identity() {
        let a = HostHash::from_host_port("a.example", 80);
        let b = HostHash::from_host_port("a.example", 8080);
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_port_matches_explicit() {
        let a = req("http://a.example/x");
        let b = req("http://a.example:80/y");
        assert_eq!(a.host_hash(), b.host_hash());
    }

    #[test]
    fn test_hex_round_trip() {
        let h = HostHash::from_host_port("a.example", 443);
        assert_eq!(HostHash::from_hex(&h.to_hex()), Some(h));
        assert_eq!(HostHash::from_hex("zz"), None);
    }

    #[test]
    fn test_host_label() {
        let r = req("https://A.Example/path");
        assert_eq!(r.host_label().as_deref(), Some("a.example:443"));
    }
}
