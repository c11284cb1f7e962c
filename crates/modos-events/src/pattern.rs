//! Dot-segmented event name patterns.
//!
//! `*` alone matches every name. Inside a pattern, a `*` segment matches
//! exactly one segment and a trailing `**` matches one or more remaining
//! segments.

pub fn is_wildcard(pattern: &str) -> bool {
    pattern.split('.').any(|segment| segment == "*" || segment == "**")
}

pub fn matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern == name {
        return true;
    }
    if !is_wildcard(pattern) {
        return false;
    }

    let mut names = name.split('.');
    let mut patterns = pattern.split('.').peekable();
    while let Some(expected) = patterns.next() {
        if expected == "**" && patterns.peek().is_none() {
            return names.next().is_some();
        }
        match names.next() {
            Some(actual) if expected == "*" || expected == actual => {}
            _ => return false,
        }
    }
    names.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_match_only_themselves() {
        assert!(matches("users.list", "users.list"));
        assert!(!matches("users.list", "users.get"));
        assert!(!matches("users", "users.list"));
    }

    #[test]
    fn star_matches_everything() {
        assert!(matches("*", "anything.at.all"));
        assert!(matches("*", "x"));
    }

    #[test]
    fn single_segment_wildcard() {
        assert!(matches("module.*", "module.discovered"));
        assert!(matches("auth.*.extract", "auth.github.extract"));
        assert!(!matches("module.*", "module"));
        assert!(!matches("module.*", "module.status.changed"));
    }

    #[test]
    fn trailing_double_star_matches_rest() {
        assert!(matches("stream.**", "stream.abc"));
        assert!(matches("bridge.**", "bridge.middleware.auth.extract"));
        assert!(!matches("bridge.**", "bridge"));
        assert!(!matches("bridge.**", "server.bridge"));
    }
}
