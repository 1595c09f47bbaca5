//! Cluster name validation, ownership matching and node selection.

use std::collections::BTreeSet;

use regex::Regex;
use tracing::warn;

use crate::{Error, ProviderRegistry, Result, LOCAL_CLUSTER};

const CLUSTER_NAME_PATTERN: &str = "^[a-zA-Z0-9-]+$";

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Reduce an account name to something usable as a DNS label prefix:
/// lowercase ASCII letters and digits only, everything after `@` dropped.
pub fn dns_safe_account(account: &str) -> String {
    let local = account.split('@').next().unwrap_or_default();
    local
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            (c.is_ascii_lowercase() || c.is_ascii_digit()).then_some(c)
        })
        .collect()
}

/// Distinct, sanitized owner accounts. A sanitization that changes an
/// account is logged.
pub fn candidate_accounts<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut accounts = Vec::new();
    for account in raw {
        let account = account.as_ref();
        if !seen.insert(account.to_string()) {
            continue;
        }
        let clean = dns_safe_account(account);
        if clean.is_empty() {
            continue;
        }
        if clean != account {
            warn!(account, username = %clean, "using sanitized account as username");
        }
        if !accounts.contains(&clean) {
            accounts.push(clean);
        }
    }
    accounts
}

/// Check `name` against the owner `accounts` and return it unchanged if it
/// is acceptable.
pub fn verify_cluster_name(name: &str, accounts: &[String]) -> Result<String> {
    if name.is_empty() {
        return Err(Error::InvalidInput("cluster name cannot be blank".into()));
    }
    if name == LOCAL_CLUSTER {
        return Ok(name.to_string());
    }
    if !is_valid_name(name) {
        return Err(Error::InvalidInput(format!(
            "cluster name must match {CLUSTER_NAME_PATTERN}"
        )));
    }

    for account in accounts {
        if let Some(rest) = name.strip_prefix(account.as_str())
            && let Some(suffix) = rest.strip_prefix('-')
            && !suffix.is_empty()
        {
            return Ok(name.to_string());
        }
    }

    let suffix = name.split_once('-').map_or(name, |(_, rest)| rest);
    let suggestions: Vec<String> = accounts.iter().map(|a| format!("{a}-{suffix}")).collect();
    Err(Error::InvalidInput(format!(
        "malformed cluster name {name}, did you mean one of [{}]",
        suggestions.join(" ")
    )))
}

/// Regex matching cluster names owned by any of `accounts`.
pub fn ownership_pattern(accounts: &[String]) -> Result<Regex> {
    if accounts.is_empty() {
        return Err(Error::InvalidInput(
            "unable to determine any active account".into(),
        ));
    }
    let alternation = accounts
        .iter()
        .map(|a| format!("(^{}-)", regex::escape(a)))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&alternation).map_err(|e| Error::InvalidInput(e.to_string()))
}

impl ProviderRegistry {
    /// Owner accounts to validate names against: the override when given,
    /// else every active provider's account.
    pub async fn owner_accounts(&self, username_override: Option<&str>) -> Result<Vec<String>> {
        match username_override.filter(|u| !u.is_empty()) {
            Some(user) => Ok(vec![user.to_string()]),
            None => {
                let active = self.find_active_accounts().await?;
                Ok(candidate_accounts(active.into_iter().map(|(_, a)| a)))
            }
        }
    }

    /// Validate `name` against the override or the discovered accounts.
    pub async fn verify_cluster_name(
        &self,
        name: &str,
        username_override: Option<&str>,
    ) -> Result<String> {
        // Reject obviously bad names before talking to any provider.
        if name == LOCAL_CLUSTER || !is_valid_name(name) {
            return verify_cluster_name(name, &[]);
        }
        let accounts = self.owner_accounts(username_override).await?;
        verify_cluster_name(name, &accounts)
    }

    /// Pattern matching every cluster owned by an active account.
    pub async fn ownership_pattern(&self) -> Result<Regex> {
        let accounts = self.owner_accounts(None).await?;
        ownership_pattern(&accounts)
    }
}

/// Parse a node selection against a cluster of `count` nodes.
///
/// Accepts `all`, `N`, `N-M` and comma-separated lists of those. Returns
/// sorted, deduplicated 1-based node numbers.
pub fn list_nodes(selection: &str, count: usize) -> Result<Vec<usize>> {
    if selection.is_empty() {
        return Err(Error::InvalidInput("no nodes specified".into()));
    }
    if selection == "all" {
        return Ok((1..=count).collect());
    }

    let parse = |s: &str| -> Result<usize> {
        s.parse::<usize>()
            .map_err(|_| Error::InvalidInput(format!("unable to parse node number {s:?}")))
    };

    let mut nodes = BTreeSet::new();
    for part in selection.split(',') {
        let (from, to) = match part.split_once('-') {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => {
                let n = parse(part)?;
                (n, n)
            }
        };
        if from == 0 || from > to {
            return Err(Error::InvalidInput(format!("invalid node range {part:?}")));
        }
        if to > count {
            return Err(Error::InvalidInput(format!(
                "node {to} is out of range, cluster has {count} nodes"
            )));
        }
        nodes.extend(from..=to);
    }
    Ok(nodes.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn accounts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rejects_non_alphanumeric_names_regardless_of_accounts() {
        for name in ["alice_perf", "alice perf", "alice.perf", "ä-x", "alice-perf!"] {
            for accts in [accounts(&[]), accounts(&["alice"])] {
                let err = verify_cluster_name(name, &accts).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidInput, "{name}");
            }
        }
    }

    #[test]
    fn test_accepts_owned_names_unchanged() {
        let accts = accounts(&["bob", "alice"]);
        assert_eq!(verify_cluster_name("alice-perf", &accts).unwrap(), "alice-perf");
        assert_eq!(verify_cluster_name("bob-a-b-c", &accts).unwrap(), "bob-a-b-c");
        assert_eq!(verify_cluster_name("local", &[]).unwrap(), "local");
    }

    #[test]
    fn test_requires_suffix_after_owner() {
        assert!(verify_cluster_name("alice-", &accounts(&["alice"])).is_err());
        assert!(verify_cluster_name("alice", &accounts(&["alice"])).is_err());
    }

    #[test]
    fn test_suggestions_one_per_account() {
        let err = verify_cluster_name("joe-perf", &accounts(&["alice", "bob"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.ends_with("[alice-perf bob-perf]"), "{msg}");

        let err = verify_cluster_name("perf", &accounts(&["alice"])).unwrap_err();
        assert!(err.to_string().ends_with("[alice-perf]"));
    }

    #[test]
    fn test_candidate_accounts_are_sanitized_and_distinct() {
        let got = candidate_accounts(["Alice.Smith@example.com", "alice", "alicesmith", "bob"]);
        assert_eq!(got, vec!["alicesmith", "alice", "bob"]);
    }

    #[test]
    fn test_ownership_pattern() {
        let re = ownership_pattern(&accounts(&["alice", "bob"])).unwrap();
        assert!(re.is_match("alice-perf"));
        assert!(re.is_match("bob-x"));
        assert!(!re.is_match("malice-perf"));
        assert!(!re.is_match("carol-alice-x"));
        assert!(ownership_pattern(&[]).is_err());
    }

    #[test]
    fn test_list_nodes() {
        assert_eq!(list_nodes("all", 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(list_nodes("2", 3).unwrap(), vec![2]);
        assert_eq!(list_nodes("1-2,3,2", 4).unwrap(), vec![1, 2, 3]);
        assert!(list_nodes("0", 3).is_err());
        assert!(list_nodes("4", 3).is_err());
        assert!(list_nodes("3-1", 3).is_err());
        assert!(list_nodes("x", 3).is_err());
        assert!(list_nodes("", 3).is_err());
    }
}
