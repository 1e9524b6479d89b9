//! IPv4 address helpers used to pair local interfaces with gateways.

use std::net::Ipv4Addr;

use crate::defaults::DEFAULT_ROUTER_CANDIDATES;

/// Returns the candidate sharing the longest run of leading bits with `target`.
///
/// Ties break in favor of the earliest candidate. Returns `None` only when
/// `candidates` is empty.
pub(crate) fn longest_prefix_match(candidates: &[Ipv4Addr], target: Ipv4Addr) -> Option<Ipv4Addr> {
    let target = u32::from(target);
    let mut best: Option<(u32, Ipv4Addr)> = None;
    for candidate in candidates {
        let common = (u32::from(*candidate) ^ target).leading_zeros();
        match best {
            Some((best_common, _)) if common <= best_common => {}
            _ => best = Some((common, *candidate)),
        }
    }
    best.map(|(_, candidate)| candidate)
}

/// Filters the default router candidates down to those in the /24 subnet of any
/// local address.
pub(crate) fn filter_router_candidates(local_ips: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    DEFAULT_ROUTER_CANDIDATES
        .iter()
        .copied()
        .filter(|candidate| local_ips.iter().any(|ip| same_subnet(*candidate, *ip)))
        .collect()
}

fn same_subnet(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    a.octets()[..3] == b.octets()[..3]
}

/// Order-preserving union. Elements of `b` not present in `a` are appended.
pub(crate) fn union<T: PartialEq + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out = a.to_vec();
    for item in b {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Order-preserving difference: elements of `a` not present in `b`.
pub(crate) fn difference<T: PartialEq + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    a.iter().filter(|item| !b.contains(item)).cloned().collect()
}

/// Computes the two router waves for a mapping attempt.
///
/// The first wave is the routers known to have responded before, plus the
/// default candidates on a local subnet. The second wave is every remaining
/// default candidate, tried only if the first wave stays silent.
pub(crate) fn router_waves(
    router_cache: &[Ipv4Addr],
    local_ips: &[Ipv4Addr],
) -> (Vec<Ipv4Addr>, Vec<Ipv4Addr>) {
    let first = union(router_cache, &filter_router_candidates(local_ips));
    let second = difference(&DEFAULT_ROUTER_CANDIDATES, &first);
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_prefers_longest() {
        let candidates = [
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(192, 168, 1, 50),
            Ipv4Addr::new(192, 168, 7, 50),
        ];
        let chosen = longest_prefix_match(&candidates, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(chosen, Some(Ipv4Addr::new(192, 168, 1, 50)));
    }

    #[test]
    fn prefix_match_ties_break_earliest() {
        // both candidates differ from the target in the last octet only
        let candidates = [Ipv4Addr::new(192, 168, 1, 40), Ipv4Addr::new(192, 168, 1, 50)];
        let chosen = longest_prefix_match(&candidates, Ipv4Addr::new(192, 168, 1, 60));
        assert_eq!(chosen, Some(Ipv4Addr::new(192, 168, 1, 40)));
    }

    #[test]
    fn prefix_match_empty() {
        assert_eq!(longest_prefix_match(&[], Ipv4Addr::new(192, 168, 1, 1)), None);
    }

    #[test]
    fn candidates_filtered_by_subnet() {
        let local = [Ipv4Addr::new(192, 168, 1, 17)];
        let filtered = filter_router_candidates(&local);
        assert_eq!(
            filtered,
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 254)]
        );

        assert!(filter_router_candidates(&[Ipv4Addr::new(127, 0, 0, 1)]).is_empty());
    }

    #[test]
    fn union_and_difference_preserve_order() {
        let a = [3u8, 1, 2];
        let b = [2u8, 4, 1];
        assert_eq!(union(&a, &b), vec![3, 1, 2, 4]);
        assert_eq!(difference(&a, &b), vec![3]);
    }

    #[test]
    fn waves_are_disjoint_and_cache_first() {
        let cache = [Ipv4Addr::new(10, 0, 0, 138)];
        let local = [Ipv4Addr::new(192, 168, 1, 17)];
        let (first, second) = router_waves(&cache, &local);
        assert_eq!(first[0], cache[0]);
        assert!(first.contains(&Ipv4Addr::new(192, 168, 1, 1)));
        for router in &first {
            assert!(!second.contains(router));
        }
        assert_eq!(first.len() + second.len(), DEFAULT_ROUTER_CANDIDATES.len() + 1);
    }
}
