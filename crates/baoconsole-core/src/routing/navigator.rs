use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Query parameter carrying the originally requested path through login.
pub const REDIRECT_PARAM: &str = "redirect_to";

/// A route plus the optional post-login destination.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Location {
    pub path: String,
    pub redirect_to: Option<String>,
}

impl Location {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            redirect_to: None,
        }
    }

    pub fn with_redirect(path: impl Into<String>, redirect_to: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            redirect_to: Some(redirect_to.into()),
        }
    }

    /// Parse `"/login?redirect_to=%2Fsecrets"`. The value is percent-decoded;
    /// other query parameters and fragments are dropped.
    pub fn parse(raw: &str) -> Self {
        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (raw, None),
        };
        let redirect_to = query.and_then(|q| {
            q.split('#')
                .next()
                .unwrap_or_default()
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(name, _)| *name == REDIRECT_PARAM)
                .map(|(_, value)| decode_component(value))
                .filter(|value| !value.is_empty())
        });
        Self {
            path: strip_query(path).to_string(),
            redirect_to,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.redirect_to {
            Some(target) => write!(f, "{}?{}={}", self.path, REDIRECT_PARAM, urlencoding::encode(target)),
            None => f.write_str(&self.path),
        }
    }
}

/// Percent-decode a query value. Escapes that are not valid UTF-8 leave the
/// value as written.
fn decode_component(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// The path part of `raw`, without query string or fragment.
pub fn strip_query(raw: &str) -> &str {
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    &raw[..end]
}

/// Where the console is and how to move it.
pub trait Navigator: Send + Sync {
    fn navigate(&self, location: &Location);

    fn current(&self) -> Location;

    fn current_path(&self) -> String {
        self.current().path
    }
}

/// In-memory navigator keeping the full history. Used headless and in tests.
pub struct HistoryNavigator {
    history: Mutex<Vec<Location>>,
}

impl HistoryNavigator {
    pub fn new(start: &str) -> Self {
        Self {
            history: Mutex::new(vec![Location::parse(start)]),
        }
    }

    pub fn history(&self) -> Vec<Location> {
        self.history.lock().clone()
    }

    /// Paths navigated to after the starting location.
    pub fn visited(&self) -> Vec<String> {
        self.history.lock().iter().skip(1).map(|l| l.path.clone()).collect()
    }
}

impl Default for HistoryNavigator {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Navigator for HistoryNavigator {
    fn navigate(&self, location: &Location) {
        self.history.lock().push(location.clone());
    }

    fn current(&self) -> Location {
        self.history.lock().last().cloned().unwrap_or_else(|| Location::new("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let loc = Location::parse("/login?foo=1&redirect_to=/secrets#top");
        assert_eq!(loc.path, "/login");
        assert_eq!(loc.redirect_to.as_deref(), Some("/secrets"));
        assert_eq!(Location::parse("/secrets?x=1").redirect_to, None);
        assert_eq!(loc.to_string(), "/login?redirect_to=%2Fsecrets");
    }

    #[test]
    fn test_redirect_survives_render_and_parse() {
        for target in ["/secrets/a&b#c", "/kv/data/x?version=2", "/team a/100%"] {
            let loc = Location::with_redirect("/login", target);
            let parsed = Location::parse(&loc.to_string());
            assert_eq!(parsed.path, "/login");
            assert_eq!(parsed.redirect_to.as_deref(), Some(target));
        }
    }

    #[test]
    fn test_undecodable_escape_kept_verbatim() {
        let loc = Location::parse("/login?redirect_to=/bad%ff");
        assert_eq!(loc.redirect_to.as_deref(), Some("/bad%ff"));
    }

    #[test]
    fn test_history() {
        let nav = HistoryNavigator::new("/dashboard");
        nav.navigate(&Location::new("/unseal"));
        assert_eq!(nav.current_path(), "/unseal");
        assert_eq!(nav.visited(), vec!["/unseal".to_string()]);
    }
}
