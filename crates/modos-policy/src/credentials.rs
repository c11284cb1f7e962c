//! Bearer credential extraction.

use std::collections::BTreeMap;

use modos_protocol::InboundRequest;

/// Cookie and query parameter names that may carry a bearer token.
pub const TOKEN_NAMES: [&str; 2] = ["access_token", "token"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Header,
    Cookie,
    Query,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Cookie => "cookie",
            Self::Query => "query",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub source: CredentialSource,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Parse a `Cookie` header into name → value pairs. Later duplicates lose.
pub fn parse_cookies(header: &str) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for pair in header.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        cookies
            .entry(name.to_owned())
            .or_insert_with(|| value.trim().trim_matches('"').to_owned());
    }
    cookies
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

/// Authorization header, then cookie, then query parameter.
pub fn extract_credential(request: &InboundRequest) -> Option<Credential> {
    if let Some(header) = request.header("authorization")
        && let Some((scheme, token)) = header.trim().split_once(' ')
        && scheme.eq_ignore_ascii_case("bearer")
        && let Some(token) = non_empty(token)
    {
        return Some(Credential {
            token,
            source: CredentialSource::Header,
        });
    }

    if let Some(header) = request.header("cookie") {
        let cookies = parse_cookies(header);
        if let Some(token) = TOKEN_NAMES
            .iter()
            .find_map(|name| cookies.get(*name).and_then(|value| non_empty(value)))
        {
            return Some(Credential {
                token,
                source: CredentialSource::Cookie,
            });
        }
    }

    TOKEN_NAMES
        .iter()
        .find_map(|name| request.query.get(*name).and_then(|value| non_empty(value)))
        .map(|token| Credential {
            token,
            source: CredentialSource::Query,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use modos_protocol::Method;

    fn request() -> InboundRequest {
        InboundRequest::new(Method::Get, "/secure")
    }

    #[test]
    fn header_wins_over_cookie_and_query() {
        let request = request()
            .with_header("Authorization", "Bearer from-header")
            .with_header("Cookie", "access_token=from-cookie")
            .with_query("token", "from-query");
        let credential = extract_credential(&request).unwrap();
        assert_eq!(credential.token, "from-header");
        assert_eq!(credential.source, CredentialSource::Header);
    }

    #[test]
    fn cookie_wins_over_query() {
        let request = request()
            .with_header("Cookie", "theme=dark; token=from-cookie")
            .with_query("access_token", "from-query");
        let credential = extract_credential(&request).unwrap();
        assert_eq!(credential.token, "from-cookie");
        assert_eq!(credential.source, CredentialSource::Cookie);
    }

    #[test]
    fn query_is_last_resort() {
        let request = request().with_query("access_token", "q");
        let credential = extract_credential(&request).unwrap();
        assert_eq!(credential.source, CredentialSource::Query);
    }

    #[test]
    fn non_bearer_and_empty_values_are_ignored() {
        let request = request()
            .with_header("Authorization", "Basic dXNlcjpwYXNz")
            .with_query("token", "  ");
        assert!(extract_credential(&request).is_none());

        let request = InboundRequest::new(Method::Get, "/").with_header("Authorization", "Bearer ");
        assert!(extract_credential(&request).is_none());
    }

    #[test]
    fn cookie_parsing_handles_spacing_and_quotes() {
        let cookies = parse_cookies(r#" a=1 ;b="two"; broken; =x; a=3"#);
        assert_eq!(cookies.get("a").map(String::as_str), Some("1"));
        assert_eq!(cookies.get("b").map(String::as_str), Some("two"));
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn debug_output_redacts_token() {
        let credential = Credential {
            token: "secret".into(),
            source: CredentialSource::Header,
        };
        assert!(!format!("{credential:?}").contains("secret"));
    }
}
