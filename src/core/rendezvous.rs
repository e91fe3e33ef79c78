//! Rendezvous role resolver.
//!
//! Two clients joining the same room must agree, without talking to each
//! other, on which of them creates the offer. The rule: sort all member
//! identities lexicographically; the member at an odd index is the
//! initiator. For any fixed pair both sides compute complementary roles
//! from the same total order, so role collisions cannot happen.

/// Connection role derived from room membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer and the data channels.
    Initiator,
    /// Waits for an offer and answers it.
    Receiver,
    /// Alone in the room; no connection should be attempted.
    Waiting,
}

impl Role {
    /// Whether a peer connection attempt is warranted for this role.
    pub fn is_active(self) -> bool {
        !matches!(self, Role::Waiting)
    }
}

/// Compute the local role from a room membership snapshot.
///
/// `member_ids` need not be sorted, deduplicated, or even contain
/// `self_id`; duplicates are collapsed and the local identity is always
/// counted. `force_initiator` short-circuits to [`Role::Initiator`]
/// unconditionally; it is the manual escape hatch for stuck negotiations.
///
/// Callers must re-resolve on every membership change rather than caching
/// a role across joins and leaves.
pub fn resolve(self_id: &str, member_ids: &[String], force_initiator: bool) -> Role {
    if force_initiator {
        return Role::Initiator;
    }

    let mut members: Vec<&str> = member_ids.iter().map(String::as_str).collect();
    if !members.iter().any(|m| *m == self_id) {
        members.push(self_id);
    }
    members.sort_unstable();
    members.dedup();

    if members.len() < 2 {
        return Role::Waiting;
    }

    // Sorted order is identical on both sides, so index parity is too.
    match members.iter().position(|m| *m == self_id) {
        Some(idx) if idx % 2 == 1 => Role::Initiator,
        Some(_) => Role::Receiver,
        // Unreachable: self_id was inserted above. Treat as waiting rather
        // than guessing a role the remote side cannot mirror.
        None => Role::Waiting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn two_members_get_complementary_roles() {
        let pairs = [("alice", "bob"), ("bob", "alice"), ("zed", "aaa")];
        for (a, b) in pairs {
            let members = ids(&[a, b]);
            let ra = resolve(a, &members, false);
            let rb = resolve(b, &members, false);
            let initiators = [ra, rb]
                .iter()
                .filter(|r| **r == Role::Initiator)
                .count();
            assert_eq!(initiators, 1, "exactly one initiator for ({a}, {b})");
            assert!(ra != rb);
        }
    }

    #[test]
    fn lexically_second_member_initiates() {
        let members = ids(&["alice", "bob"]);
        assert_eq!(resolve("bob", &members, false), Role::Initiator);
        assert_eq!(resolve("alice", &members, false), Role::Receiver);
    }

    #[test]
    fn single_member_waits() {
        assert_eq!(resolve("alice", &ids(&["alice"]), false), Role::Waiting);
        assert_eq!(resolve("alice", &[], false), Role::Waiting);
    }

    #[test]
    fn force_override_dominates() {
        assert_eq!(resolve("alice", &ids(&["alice", "bob"]), true), Role::Initiator);
        assert_eq!(resolve("alice", &[], true), Role::Initiator);
        assert_eq!(
            resolve("zzz", &ids(&["aaa", "bbb", "zzz"]), true),
            Role::Initiator
        );
    }

    #[test]
    fn duplicates_and_missing_self_are_tolerated() {
        let members = ids(&["bob", "bob", "alice", "alice"]);
        assert_eq!(resolve("bob", &members, false), Role::Initiator);

        // Snapshot that omits the local identity entirely.
        let members = ids(&["alice"]);
        assert_eq!(resolve("bob", &members, false), Role::Initiator);
        assert_eq!(resolve("aaa", &members, false), Role::Receiver);
    }
}
