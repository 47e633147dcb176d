//! Permission expressions.
//!
//! An ACL is an ordered list of signed matchers evaluated against a
//! principal. Evaluation is declaration order, first match wins, default
//! deny. Expressions are parsed once at config load and kept compiled.

use skua_core::Principal;

/// What a single term matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    /// Bare name: matches the user name exactly.
    User(String),
    /// `=name`: matches any of the principal's groups.
    Group(String),
    /// `-X`: matches if flag character X is present.
    Flag(char),
    /// `*`: matches any principal.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    matcher: Matcher,
    /// True for plain terms (match ⇒ allow); `!` inverts to deny.
    allow: bool,
}

/// A compiled permission expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acl {
    terms: Vec<Term>,
}

impl Acl {
    /// Parse a whitespace-separated expression, e.g. `"-1 =staff !* "`.
    ///
    /// Group lookups are by name; the caller resolves group names to ids at
    /// evaluation time via the principal's resolved group names.
    pub fn from_string(expr: &str) -> Self {
        let terms = expr
            .split_whitespace()
            .filter_map(|tok| {
                let (allow, body) = match tok.strip_prefix('!') {
                    Some(rest) => (false, rest),
                    None => (true, tok),
                };
                if body.is_empty() {
                    return None;
                }
                let matcher = if body == "*" {
                    Matcher::Any
                } else if let Some(group) = body.strip_prefix('=') {
                    Matcher::Group(group.to_string())
                } else if let Some(flags) = body.strip_prefix('-') {
                    Matcher::Flag(flags.chars().next()?)
                } else {
                    Matcher::User(body.to_string())
                };
                Some(Term { matcher, allow })
            })
            .collect();
        Self { terms }
    }

    /// Expression allowing everyone.
    pub fn allow_all() -> Self {
        Self::from_string("*")
    }

    /// Expression denying everyone.
    pub fn deny_all() -> Self {
        Self::from_string("!*")
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluate against a principal. Pure; no I/O.
    ///
    /// `group_names` carries the resolved names of the principal's groups in
    /// the same order as `principal.gids`.
    pub fn check(&self, principal: &Principal, group_names: &[String]) -> bool {
        for term in &self.terms {
            let matched = match &term.matcher {
                Matcher::Any => true,
                Matcher::User(name) => *name == principal.name,
                Matcher::Group(name) => group_names.iter().any(|g| g == name),
                Matcher::Flag(f) => principal.has_flag(*f),
            };
            if matched {
                return term.allow;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(name: &str, flags: &str) -> Principal {
        Principal {
            uid: 1,
            name: name.to_string(),
            primary_gid: 10,
            gids: vec![10],
            flags: flags.to_string(),
        }
    }

    #[test]
    fn wildcard_allows_everyone() {
        let acl = Acl::from_string("*");
        assert!(acl.check(&principal("alice", "3"), &["users".into()]));
    }

    #[test]
    fn negated_wildcard_denies_everyone() {
        let acl = Acl::from_string("!*");
        assert!(!acl.check(&principal("alice", "1"), &[]));
    }

    #[test]
    fn empty_expression_denies() {
        let acl = Acl::from_string("");
        assert!(!acl.check(&principal("alice", "1"), &[]));
    }

    #[test]
    fn user_name_matches_exactly() {
        let acl = Acl::from_string("alice");
        assert!(acl.check(&principal("alice", "3"), &[]));
        assert!(!acl.check(&principal("alicia", "3"), &[]));
    }

    #[test]
    fn group_matcher_uses_any_group() {
        let acl = Acl::from_string("=staff");
        assert!(acl.check(&principal("bob", "3"), &["users".into(), "staff".into()]));
        assert!(!acl.check(&principal("bob", "3"), &["users".into()]));
    }

    #[test]
    fn flag_matcher() {
        let acl = Acl::from_string("-1");
        assert!(acl.check(&principal("op", "13"), &[]));
        assert!(!acl.check(&principal("pleb", "3"), &[]));
    }

    #[test]
    fn first_match_wins() {
        // bob is denied before the wildcard allows.
        let acl = Acl::from_string("!bob *");
        assert!(!acl.check(&principal("bob", "3"), &[]));
        assert!(acl.check(&principal("alice", "3"), &[]));
        // Declaration order matters: the wildcard shadows the later deny.
        let acl = Acl::from_string("* !bob");
        assert!(acl.check(&principal("bob", "3"), &[]));
    }

    #[test]
    fn negated_group_and_flag() {
        let acl = Acl::from_string("!=banned !-6 *");
        assert!(!acl.check(&principal("x", "3"), &["banned".into()]));
        assert!(!acl.check(&principal("x", "36"), &[]));
        assert!(acl.check(&principal("x", "3"), &["users".into()]));
    }

    #[test]
    fn check_is_idempotent() {
        let acl = Acl::from_string("-1 =staff !*");
        let p = principal("alice", "1");
        let first = acl.check(&p, &[]);
        for _ in 0..10 {
            assert_eq!(acl.check(&p, &[]), first);
        }
    }
}
