//! Sender allow-list.
//!
//! Entries are comma or newline separated. An entry is `*` (anyone), a full
//! address, `@domain` or a bare `domain`. An empty list permits nobody.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .split([',', '\n'])
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `email` may submit receipts.
    pub fn permits(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.entries.iter().any(|entry| match entry.as_str() {
            "*" => true,
            domain if domain.starts_with('@') => email.ends_with(domain),
            address if address.contains('@') => address == email,
            domain => email
                .rsplit_once('@')
                .is_some_and(|(_, host)| host == domain),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_denies_all() {
        let list = AllowList::parse("");
        assert!(list.is_empty());
        assert!(!list.permits("anyone@example.com"));
    }

    #[test]
    fn wildcard_allows_all() {
        let list = AllowList::parse("*");
        assert!(list.permits("anyone@example.com"));
        assert!(list.permits("test@other.org"));
    }

    #[test]
    fn exact_address_case_insensitive() {
        let list = AllowList::parse("Alice@Example.com");
        assert!(list.permits("alice@example.com"));
        assert!(list.permits("ALICE@example.COM"));
        assert!(!list.permits("bob@example.com"));
    }

    #[test]
    fn domain_forms() {
        let list = AllowList::parse("@example.com\nfamily.org");
        assert!(list.permits("alice@example.com"));
        assert!(list.permits("kid@family.org"));
        assert!(!list.permits("alice@other.com"));
        assert!(!list.permits("x@notfamily.org"));
    }

    #[test]
    fn separators_and_whitespace() {
        let list = AllowList::parse(" alice@example.com , bob@example.com\n\n,");
        assert_eq!(list.entries(), ["alice@example.com", "bob@example.com"]);
    }
}
