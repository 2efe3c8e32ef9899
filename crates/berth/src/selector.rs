// Copyright 2025 Berth Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Weighted server selection.
//!
//! Each eligible server is owed a share of the pool proportional to its
//! weight. The selector picks the server that is furthest below its share,
//! preferring servers that have no connection at all.

use crate::registry::ServerId;

/// One eligible server as seen by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub server: ServerId,
    pub weight: u32,
    /// Live connections plus dials in flight.
    pub connections: usize,
}

/// Share of `effective_max` owed to a server of `weight`, rounded half away
/// from zero.
pub fn requirement(effective_max: usize, weight: u32, total_weight: u64) -> usize {
    if total_weight == 0 {
        return 0;
    }
    (effective_max as f64 * f64::from(weight) / total_weight as f64).round() as usize
}

/// Picks the server most in need of a new connection.
///
/// `candidates` must be the backoff-eligible servers in registry order.
/// `total` is the pool-wide connection count, which can exceed `max` only
/// transiently; the target is computed against `max(max, total + 1)` so that
/// the server that would receive the next connection is always found.
///
/// Returns `None` when there is no candidate.
pub fn recommend(candidates: &[Candidate], max: usize, total: usize) -> Option<ServerId> {
    if candidates.is_empty() {
        return None;
    }

    let effective_max = max.max(total + 1);
    let total_weight: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();

    let mut best: Option<(ServerId, f64)> = None;
    for candidate in candidates {
        let required = requirement(effective_max, candidate.weight, total_weight);

        if candidate.connections == 0 && required > 0 {
            return Some(candidate.server);
        }

        let ratio = if required == 0 {
            f64::INFINITY
        } else {
            candidate.connections as f64 / required as f64
        };

        match best {
            Some((_, lowest)) if ratio >= lowest => {}
            _ => best = Some((candidate.server, ratio)),
        }
    }

    best.map(|(server, _)| server)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(shape: &[(u32, usize)]) -> Vec<Candidate> {
        shape.iter()
            .enumerate()
            .map(|(index, &(weight, connections))| Candidate {
                server: ServerId::new(index),
                weight,
                connections,
            })
            .collect()
    }

    /// Repeatedly recommends and grows the chosen server until `max`.
    fn fill(weights: &[u32], max: usize) -> Vec<usize> {
        let mut counts = vec![0usize; weights.len()];
        for _ in 0..max {
            let shape: Vec<(u32, usize)> = weights.iter().copied().zip(counts.iter().copied()).collect();
            let total = counts.iter().sum();
            let chosen = recommend(&candidates(&shape), max, total).unwrap();
            counts[chosen.index()] += 1;
        }
        counts
    }

    #[test]
    fn test_empty_returns_none() {
        assert_eq!(recommend(&[], 10, 0), None);
    }

    #[test]
    fn test_requirement_rounding() {
        assert_eq!(requirement(8, 1, 4), 2);
        assert_eq!(requirement(8, 3, 4), 6);
        // 10 * 1 / 4 = 2.5 rounds up
        assert_eq!(requirement(10, 1, 4), 3);
        assert_eq!(requirement(1, 1, 3), 0);
        assert_eq!(requirement(5, 1, 0), 0);
    }

    #[test]
    fn test_empty_server_wins_immediately() {
        let list = candidates(&[(1, 3), (1, 0), (1, 0)]);
        assert_eq!(recommend(&list, 10, 3), Some(ServerId::new(1)));
    }

    #[test]
    fn test_lowest_ratio_wins() {
        // requirements 5 and 5: ratios 0.8 and 0.2
        let list = candidates(&[(1, 4), (1, 1)]);
        assert_eq!(recommend(&list, 10, 5), Some(ServerId::new(1)));
    }

    #[test]
    fn test_ties_break_by_registry_order() {
        let list = candidates(&[(1, 2), (1, 2)]);
        assert_eq!(recommend(&list, 10, 4), Some(ServerId::new(0)));
    }

    #[test]
    fn test_zero_requirement_ranks_last() {
        // effective max 3 over weights 1 + 10: the light server is owed 0
        let list = candidates(&[(1, 1), (10, 2)]);
        assert_eq!(recommend(&list, 3, 3), Some(ServerId::new(1)));
    }

    #[test]
    fn test_zero_requirement_empty_server_is_not_forced() {
        let list = candidates(&[(1, 0), (20, 1)]);
        // weight 1 of 21 with effective max 2 rounds to 0
        assert_eq!(recommend(&list, 2, 1), Some(ServerId::new(1)));
    }

    #[test]
    fn test_weighted_fill_converges() {
        assert_eq!(fill(&[1, 3], 8), vec![2, 6]);
        assert_eq!(fill(&[1, 1], 10), vec![5, 5]);
        assert_eq!(fill(&[2, 1, 1], 8), vec![4, 2, 2]);
    }

    #[test]
    fn test_effective_max_grows_past_max() {
        // pool already at max: the next connection still has a home
        let list = candidates(&[(1, 2), (3, 6)]);
        assert!(recommend(&list, 8, 8).is_some());
    }
}
