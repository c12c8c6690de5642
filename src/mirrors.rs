//! Deterministic derivation of mirror allocations.
//!
//! A quota of N on a master allocation stands for N independently bookable
//! copies of the same timespan. Only the master is persisted up front; the
//! up to N-1 mirrors get their resource keys derived from the master's key
//! and their 1-based index. The derivation is replayable anywhere, so no
//! lookup table is needed to address a mirror, and no more mirror rows than
//! necessary ever exist: a mirror is materialized the first time a
//! reservation claims it.

use uuid::Uuid;

use crate::models::{Allocation, AllocationId};

/// Derive the resource key of the mirror at `index` (1-based).
///
/// Uuid v5 of the master key as namespace and the decimal index as name:
/// stable, collision-resistant and reproducible without storage access.
pub fn mirror_key(master: Uuid, index: u32) -> Uuid {
    Uuid::new_v5(&master, index.to_string().as_bytes())
}

/// The mirror keys of a master in derivation order, `index = 1..quota-1`.
pub fn mirror_keys(master: Uuid, quota: u32) -> impl Iterator<Item = Uuid> {
    (1..quota).map(move |index| mirror_key(master, index))
}

/// The canonical ordered key list of a master: the master's own key followed
/// by its mirror keys. Quota reorganization walks this list.
pub fn keylist(master: Uuid, quota: u32) -> Vec<Uuid> {
    std::iter::once(master).chain(mirror_keys(master, quota)).collect()
}

/// An allocation that can satisfy a claim: either a persisted row or a
/// virtual mirror derived on the fly.
///
/// Virtual mirrors behave exactly like persisted allocations but exist only
/// in memory until a reservation claims them, at which point the row is
/// written with the derived key.
#[derive(Debug, Clone)]
pub enum Spot {
    Persisted(Allocation),
    Virtual(Allocation),
}

impl Spot {
    pub fn allocation(&self) -> &Allocation {
        match self {
            Spot::Persisted(allocation) | Spot::Virtual(allocation) => allocation,
        }
    }

    pub fn into_allocation(self) -> Allocation {
        match self {
            Spot::Persisted(allocation) | Spot::Virtual(allocation) => allocation,
        }
    }

    /// True if claiming this spot must first write the allocation row.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Spot::Virtual(_))
    }
}

/// Build the virtual mirror of a master for the given derived key.
///
/// Mirrors share the master's span, raster and flags; only identity differs.
pub fn virtual_mirror(master: &Allocation, key: Uuid) -> Allocation {
    let mut mirror = master.clone();
    mirror.id = AllocationId::new();
    mirror.resource = key;
    mirror.recurrence_id = None;
    mirror
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn derivation_is_stable() {
        let master = Uuid::new_v4();
        assert_eq!(mirror_key(master, 1), mirror_key(master, 1));
        assert_ne!(mirror_key(master, 1), mirror_key(master, 2));
    }

    #[test]
    fn keylist_starts_with_the_master_and_has_quota_entries() {
        let master = Uuid::new_v4();
        let keys = keylist(master, 4);

        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0], master);

        let distinct: HashSet<_> = keys.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn different_masters_never_share_keys() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let keys_a: HashSet<_> = keylist(a, 10).into_iter().collect();
        let keys_b: HashSet<_> = keylist(b, 10).into_iter().collect();

        assert!(keys_a.is_disjoint(&keys_b));
    }
}
