//! Locating the credential in an upgrade request.
//!
//! Sources are tried in order: `?token=` query parameter, `Authorization:
//! Bearer <token>`, then a `Sec-WebSocket-Protocol` entry of the form
//! `token-<token>`. Browsers cannot set headers on WebSocket requests, which
//! is why the last two fallbacks exist.

/// Prefix marking a subprotocol entry that carries a token.
pub const PROTOCOL_TOKEN_PREFIX: &str = "token-";

/// Where the token came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// `token` query parameter.
    Query,
    /// `Authorization: Bearer` header.
    Bearer,
    /// Subprotocol entry. Holds the full entry so it can be echoed back.
    Protocol(String),
}

/// A raw, unvalidated token and its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToken {
    /// Encoded JWT.
    pub token: String,
    /// Source it was read from.
    pub source: TokenSource,
}

/// Pick the token out of the three candidate locations.
///
/// `query_token` is the already-decoded `token` query value;
/// `authorization` and `protocols` are raw header values.
pub fn extract_token(
    query_token: Option<&str>,
    authorization: Option<&str>,
    protocols: Option<&str>,
) -> Option<ExtractedToken> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(ExtractedToken {
            token: token.to_owned(),
            source: TokenSource::Query,
        });
    }

    if let Some(token) = authorization.and_then(bearer) {
        return Some(ExtractedToken {
            token: token.to_owned(),
            source: TokenSource::Bearer,
        });
    }

    protocols?
        .split(',')
        .map(str::trim)
        .find_map(|entry| {
            let token = entry.strip_prefix(PROTOCOL_TOKEN_PREFIX)?;
            (!token.is_empty()).then(|| ExtractedToken {
                token: token.to_owned(),
                source: TokenSource::Protocol(entry.to_owned()),
            })
        })
}

fn bearer(header: &str) -> Option<&str> {
    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Some(token),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_wins() {
        let t = extract_token(Some("q"), Some("Bearer b"), Some("token-p")).unwrap();
        assert_eq!(t.token, "q");
        assert_eq!(t.source, TokenSource::Query);
    }

    #[test]
    fn bearer_before_protocol() {
        let t = extract_token(None, Some("Bearer b"), Some("token-p")).unwrap();
        assert_eq!(t.token, "b");
        assert_eq!(t.source, TokenSource::Bearer);
    }

    #[test]
    fn empty_query_falls_through() {
        let t = extract_token(Some(""), Some("Bearer b"), None).unwrap();
        assert_eq!(t.source, TokenSource::Bearer);
    }

    #[test]
    fn malformed_bearer_ignored() {
        assert!(extract_token(None, Some("Basic abc"), None).is_none());
        assert!(extract_token(None, Some("Bearer"), None).is_none());
        assert!(extract_token(None, Some("Bearer a b"), None).is_none());
        assert!(extract_token(None, Some("bearer abc"), None).is_none());
    }

    #[test]
    fn protocol_entry_found_among_others() {
        let t = extract_token(None, None, Some("json, token-abc.def.ghi , v2")).unwrap();
        assert_eq!(t.token, "abc.def.ghi");
        assert_eq!(t.source, TokenSource::Protocol("token-abc.def.ghi".into()));
    }

    #[test]
    fn nothing_found() {
        assert!(extract_token(None, None, None).is_none());
        assert!(extract_token(None, None, Some("json, token-")).is_none());
    }
}
