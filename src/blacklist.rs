use parking_lot::RwLock;
use url::Url;

/// Crawler blacklist boundary. Full pattern matching lives in the admission
/// gate; the scheduler only re-checks entries at pop time because rules may
/// have been added after a request was queued.
pub trait Blacklist: Send + Sync {
    fn is_listed(&self, url: &Url) -> bool;
}

/// Accepts everything.
pub struct NoBlacklist;

impl Blacklist for NoBlacklist {
    fn is_listed(&self, _url: &Url) -> bool {
        false
    }
}

/// Substring rules over the full URL, appendable at runtime. Enough for the
/// pop-time re-check; not a reimplementation of the gate's matching language.
pub struct SubstringBlacklist {
    patterns: RwLock<Vec<String>>,
}

impl SubstringBlacklist {
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, pattern: impl Into<String>) {
        self.patterns.write().push(pattern.into());
    }
}

impl Default for SubstringBlacklist {
    fn default() -> Self {
        Self::new()
    }
}

impl Blacklist for SubstringBlacklist {
    fn is_listed(&self, url: &Url) -> bool {
        let url_str = url.as_str();
        self.patterns.read().iter().any(|p| url_str.contains(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match() {
        let bl = SubstringBlacklist::new();
        assert!(!bl.is_listed(&Url::parse("http://a.example/ads/1").unwrap()));
        bl.add("/ads/");
        assert!(bl.is_listed(&Url::parse("http://a.example/ads/1").unwrap()));
        assert!(!bl.is_listed(&Url::parse("http://a.example/news/1").unwrap()));
    }
}
