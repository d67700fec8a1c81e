//! Linux capability management for least-privilege execution.
//!
//! Computes which capabilities the contained process keeps and which are
//! removed from the bounding set before exec.

use caps::{Capability, CapsHashSet};

/// Returns `granted` minus every capability in `excluded`.
#[must_use]
pub fn retained_set(granted: &CapsHashSet, excluded: &[Capability]) -> CapsHashSet {
    granted
        .iter()
        .filter(|cap| !excluded.contains(cap))
        .copied()
        .collect()
}

/// Returns every capability supported by the running kernel that is not
/// in `retain`, in a stable order.
///
/// These are removed from the bounding set so no later exec can regain
/// them.
#[must_use]
pub fn bounding_complement(retain: &CapsHashSet) -> Vec<Capability> {
    let mut dropped: Vec<Capability> = caps::runtime::thread_all_supported()
        .into_iter()
        .filter(|cap| !retain.contains(cap))
        .collect();
    dropped.sort_by_key(|cap| cap.index());
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_set_removes_excluded() {
        let granted: CapsHashSet = [
            Capability::CAP_CHOWN,
            Capability::CAP_NET_RAW,
            Capability::CAP_SYS_ADMIN,
        ]
        .into_iter()
        .collect();
        let retained = retained_set(&granted, &[Capability::CAP_NET_RAW]);
        assert_eq!(retained.len(), 2);
        assert!(!retained.contains(&Capability::CAP_NET_RAW));
        assert!(retained.contains(&Capability::CAP_SYS_ADMIN));
    }

    #[test]
    fn bounding_complement_of_empty_set_is_everything() {
        let dropped = bounding_complement(&CapsHashSet::new());
        assert!(dropped.contains(&Capability::CAP_SYS_ADMIN));
        assert!(dropped.contains(&Capability::CAP_CHOWN));
    }

    #[test]
    fn bounding_complement_keeps_retained() {
        let retain: CapsHashSet = std::iter::once(Capability::CAP_KILL).collect();
        let dropped = bounding_complement(&retain);
        assert!(!dropped.contains(&Capability::CAP_KILL));
        assert!(dropped.windows(2).all(|w| w[0].index() < w[1].index()));
    }
}
