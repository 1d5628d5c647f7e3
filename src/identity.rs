use std::collections::HashMap;

use crate::core::AuthorId;

/// Maps commit signatures to stable author ids.
///
/// Signatures are merged by normalized email first, then by normalized
/// name, so "Jane <jane@x.org>" and "Jane Doe <jane@x.org>" collapse to
/// one author while distinct people sharing no identifier stay separate.
#[derive(Debug, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct IdentityDetector {
    by_email: HashMap<String, AuthorId>,
    by_name: HashMap<String, AuthorId>,
    people: Vec<String>,
}

impl IdentityDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, name: &str, email: &str) -> AuthorId {
        let norm_email = email.trim().to_lowercase();
        let norm_name = name.trim().to_lowercase();

        if !norm_email.is_empty() {
            if let Some(&id) = self.by_email.get(&norm_email) {
                self.by_name.entry(norm_name).or_insert(id);
                return id;
            }
        }
        if !norm_name.is_empty() {
            if let Some(&id) = self.by_name.get(&norm_name) {
                if !norm_email.is_empty() {
                    self.by_email.insert(norm_email, id);
                }
                return id;
            }
        }

        let id = self.people.len();
        self.people.push(format!("{} <{}>", name.trim(), email.trim()));
        if !norm_email.is_empty() {
            self.by_email.insert(norm_email, id);
        }
        if !norm_name.is_empty() {
            self.by_name.insert(norm_name, id);
        }
        id
    }

    /// The reversed people dict: author id -> display signature.
    pub fn people(&self) -> &[String] {
        &self.people
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_people_get_distinct_ids() {
        let mut detector = IdentityDetector::new();
        let alice = detector.resolve("Alice", "alice@example.com");
        let bob = detector.resolve("Bob", "bob@example.com");
        assert_ne!(alice, bob);
        assert_eq!(detector.len(), 2);
    }

    #[test]
    fn same_email_merges_despite_name_change() {
        let mut detector = IdentityDetector::new();
        let a = detector.resolve("Alice", "alice@example.com");
        let b = detector.resolve("Alice Liddell", "ALICE@example.com");
        assert_eq!(a, b);
        assert_eq!(detector.len(), 1);
    }

    #[test]
    fn same_name_merges_across_emails() {
        let mut detector = IdentityDetector::new();
        let a = detector.resolve("Alice", "alice@work.com");
        let b = detector.resolve("alice", "alice@home.net");
        assert_eq!(a, b);
        // The second email becomes an alias for the same id.
        let c = detector.resolve("Someone Else", "alice@home.net");
        assert_eq!(a, c);
    }

    #[test]
    fn people_preserves_first_seen_signature() {
        let mut detector = IdentityDetector::new();
        detector.resolve("Alice", "alice@example.com");
        detector.resolve("Alice Liddell", "alice@example.com");
        assert_eq!(detector.people(), ["Alice <alice@example.com>"]);
    }
}
