//! Caller identity used by the permission pipeline.

use crate::types::acl::PUBLIC_MARKER;

/// Prefix marking a role identifier inside an ACL group.
pub const ROLE_PREFIX: &str = "role:";

/// The identity a request runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Trusted caller: every authorization step is skipped.
    Master,
    /// Untrusted caller carrying its ACL group.
    Client(AclGroup),
}

impl Caller {
    pub fn master() -> Self {
        Caller::Master
    }

    /// Builds an untrusted caller from raw identifiers (user id, role names
    /// prefixed with `role:`, and the public marker).
    pub fn client(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Caller::Client(AclGroup::new(ids.into_iter().map(Into::into).collect()))
    }

    /// An unauthenticated caller: the public marker only.
    pub fn public() -> Self {
        Caller::client([PUBLIC_MARKER])
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Caller::Master)
    }

    pub fn acl_group(&self) -> Option<&AclGroup> {
        match self {
            Caller::Master => None,
            Caller::Client(group) => Some(group),
        }
    }
}

/// The set of identifiers representing a non-trusted caller: the user id,
/// each held role as `role:<name>`, and `*` for public access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclGroup {
    ids: Vec<String>,
}

impl AclGroup {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }

    /// The group of an unauthenticated caller.
    pub fn public_group() -> Self {
        Self::new(vec![PUBLIC_MARKER.to_string()])
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    /// True when the group carries any identifier beyond the public marker.
    pub fn is_authenticated(&self) -> bool {
        self.ids.iter().any(|i| i != PUBLIC_MARKER)
    }

    /// Role identifiers held by the caller, `role:` prefix included.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.ids
            .iter()
            .map(String::as_str)
            .filter(|i| i.starts_with(ROLE_PREFIX))
    }

    /// The single non-role, non-public identifier, when exactly one exists.
    ///
    /// Pointer permissions require unambiguous ownership: zero or several
    /// candidate user ids make the rule non-satisfiable.
    pub fn sole_user_id(&self) -> Option<&str> {
        let mut candidates = self
            .ids
            .iter()
            .map(String::as_str)
            .filter(|i| *i != PUBLIC_MARKER && !i.starts_with(ROLE_PREFIX));
        let first = candidates.next()?;
        if candidates.next().is_some() {
            return None;
        }
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_group_is_not_authenticated() {
        let caller = Caller::public();
        let group = caller.acl_group().unwrap();
        assert!(!group.is_authenticated());
        assert!(group.contains("*"));
    }

    #[test]
    fn sole_user_id_requires_exactly_one_candidate() {
        let one = AclGroup::new(vec!["*".into(), "role:mod".into(), "u1".into()]);
        assert_eq!(one.sole_user_id(), Some("u1"));

        let none = AclGroup::new(vec!["*".into(), "role:mod".into()]);
        assert_eq!(none.sole_user_id(), None);

        let two = AclGroup::new(vec!["u1".into(), "u2".into()]);
        assert_eq!(two.sole_user_id(), None);
    }

    #[test]
    fn roles_are_filtered_by_prefix() {
        let group = AclGroup::new(vec!["u1".into(), "role:a".into(), "role:b".into()]);
        let roles: Vec<_> = group.roles().collect();
        assert_eq!(roles, vec!["role:a", "role:b"]);
    }
}
