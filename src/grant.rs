//! Grant evaluation.
//!
//! A grant permits an account to act as an OS user on every node whose
//! hostname matches the grant's pattern, until it expires.

use std::collections::HashMap;

use crate::directory::{Grant, GrantItem, Node};

/// Match `value` against a pattern where `*` stands for any run of
/// characters (including none). Both sides are trimmed first; a pattern
/// without `*` must equal the value exactly.
pub fn match_asterisk(pattern: &str, value: &str) -> bool {
    let pattern = pattern.trim();
    let value = value.trim();
    if pattern.is_empty() || !pattern.contains('*') {
        return pattern == value;
    }

    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();

    // Iterative wildcard match with single-star backtracking.
    let (mut pi, mut vi) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while vi < v.len() {
        if pi < p.len() && p[pi] != '*' && p[pi] == v[vi] {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = vi;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            vi = mark;
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// A grant is active while `expired_at` is zero (never expires) or in the future.
pub fn is_active(expired_at: i64, now: i64) -> bool {
    expired_at == 0 || expired_at > now
}

/// Whether any active grant allows `user` on `hostname`.
pub fn check<'a>(
    grants: impl IntoIterator<Item = &'a Grant>,
    user: &str,
    hostname: &str,
    now: i64,
) -> bool {
    grants.into_iter().any(|g| {
        g.user == user && is_active(g.expired_at, now) && match_asterisk(&g.hostname_pattern, hostname)
    })
}

/// Expand grants against the node list into concrete `(hostname, user)`
/// items, merged so each pair appears once.
pub fn list_items<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    grants: &[Grant],
    now: i64,
) -> Vec<GrantItem> {
    let mut items = Vec::new();
    for node in nodes {
        for grant in grants {
            if is_active(grant.expired_at, now) && match_asterisk(&grant.hostname_pattern, &node.hostname) {
                items.push(GrantItem {
                    hostname: node.hostname.clone(),
                    user: grant.user.clone(),
                    expired_at: grant.expired_at,
                });
            }
        }
    }
    compact_items(items)
}

/// Merge items sharing `(hostname, user)`. A never-expiring item wins,
/// otherwise the later expiry is kept. First-seen order is preserved.
pub fn compact_items(items: Vec<GrantItem>) -> Vec<GrantItem> {
    let mut out: Vec<GrantItem> = Vec::with_capacity(items.len());
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for item in items {
        let key = (item.hostname.clone(), item.user.clone());
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut out[i];
                if existing.expired_at == 0 || item.expired_at == 0 {
                    existing.expired_at = 0;
                } else if item.expired_at > existing.expired_at {
                    existing.expired_at = item.expired_at;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(item);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(pattern: &str, user: &str, expired_at: i64) -> Grant {
        Grant {
            account: "alice".to_string(),
            hostname_pattern: pattern.to_string(),
            user: user.to_string(),
            expired_at,
        }
    }

    fn node(hostname: &str) -> Node {
        Node {
            hostname: hostname.to_string(),
            address: format!("{hostname}.internal:22"),
            key_managed: false,
        }
    }

    fn item(hostname: &str, user: &str, expired_at: i64) -> GrantItem {
        GrantItem {
            hostname: hostname.to_string(),
            user: user.to_string(),
            expired_at,
        }
    }

    #[test]
    fn test_match_asterisk() {
        assert!(match_asterisk("hello", "hello"));
        assert!(match_asterisk(" hello ", "hello"));
        assert!(!match_asterisk("hello", "hello.world"));
        assert!(match_asterisk("hello.*", "hello.world"));
        assert!(match_asterisk("*", ""));
        assert!(match_asterisk("*", "anything"));
        assert!(match_asterisk("web-*-prod", "web-01-prod"));
        assert!(!match_asterisk("web-*-prod", "web-01-staging"));
        assert!(match_asterisk("*.example.com", "db.example.com"));
        assert!(match_asterisk("a*a", "aaa"));
        assert!(!match_asterisk("", "x"));
        assert!(match_asterisk("", ""));
    }

    #[test]
    fn test_match_asterisk_unicode() {
        assert!(match_asterisk("你好*", "你好世界"));
        assert!(!match_asterisk("你好*", "好世界"));
        assert!(match_asterisk("你*世界", "你好世界"));
        assert!(!match_asterisk("你*世界", "你好"));
    }

    #[test]
    fn test_grant_expiry() {
        let now = 1_700_000_000;
        let forever = [grant("db-*", "root", 0)];
        assert!(check(&forever, "root", "db-1", now));
        assert!(check(&forever, "root", "db-1", now + 1_000_000));

        let short = [grant("db-*", "root", now + 1)];
        assert!(check(&short, "root", "db-1", now));
        assert!(!check(&short, "root", "db-1", now + 2));
    }

    #[test]
    fn test_check_requires_user_and_pattern() {
        let grants = [grant("db-*", "root", 0)];
        assert!(!check(&grants, "deploy", "db-1", 0));
        assert!(!check(&grants, "root", "web-1", 0));
    }

    #[test]
    fn test_compact_non_expiring_wins() {
        let merged = compact_items(vec![item("h1", "u", 0), item("h1", "u", 500)]);
        assert_eq!(merged, vec![item("h1", "u", 0)]);

        let merged = compact_items(vec![item("h1", "u", 500), item("h1", "u", 0)]);
        assert_eq!(merged, vec![item("h1", "u", 0)]);
    }

    #[test]
    fn test_compact_later_expiry_wins() {
        let merged = compact_items(vec![
            item("h1", "u", 100),
            item("h2", "u", 50),
            item("h1", "u", 300),
            item("h1", "other", 10),
        ]);
        assert_eq!(
            merged,
            vec![item("h1", "u", 300), item("h2", "u", 50), item("h1", "other", 10)]
        );
    }

    #[test]
    fn test_list_items_expands_patterns() {
        let nodes = [node("db-1"), node("db-2"), node("web-1")];
        let grants = vec![
            grant("db-*", "root", 0),
            grant("*", "deploy", 200),
            grant("web-*", "root", 50),
        ];
        let items = list_items(&nodes, &grants, 100);
        assert_eq!(
            items,
            vec![
                item("db-1", "root", 0),
                item("db-1", "deploy", 200),
                item("db-2", "root", 0),
                item("db-2", "deploy", 200),
                item("web-1", "deploy", 200),
            ]
        );
    }
}
