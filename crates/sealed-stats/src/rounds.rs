//! Round ("match") scoring used for participant feedback.
//!
//! A threshold rule, not a test: consecutive trials are grouped into rounds
//! and a round is won when its hit count reaches the win threshold.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundScore {
    /// `ceil(trials / round_size)`; a trailing partial round counts.
    pub rounds_total: usize,
    pub rounds_won: usize,
    pub hits_per_round: Vec<usize>,
}

/// Group `hits` into rounds of `round_size` and count the wins.
pub fn score_rounds(hits: &[bool], round_size: usize, win_hits: usize) -> RoundScore {
    if round_size == 0 {
        return RoundScore {
            rounds_total: 0,
            rounds_won: 0,
            hits_per_round: Vec::new(),
        };
    }
    let hits_per_round: Vec<usize> = hits
        .chunks(round_size)
        .map(|round| round.iter().filter(|&&h| h).count())
        .collect();
    RoundScore {
        rounds_total: hits_per_round.len(),
        rounds_won: hits_per_round.iter().filter(|&&h| h >= win_hits).count(),
        hits_per_round,
    }
}

/// Score each block on its own, in trial-number order, and sum the rounds.
///
/// A trial without a selection keeps its slot as a miss, so a timeout does
/// not shift later trials into another round and no round spans two blocks.
pub fn score_blocks<'a, I>(trials: I, round_size: usize, win_hits: usize) -> RoundScore
where
    I: IntoIterator<Item = (&'a str, u32, bool)>,
{
    let mut blocks: Vec<(&str, Vec<(u32, bool)>)> = Vec::new();
    for (block_id, trial_number, hit) in trials {
        match blocks.iter_mut().find(|(id, _)| *id == block_id) {
            Some((_, seq)) => seq.push((trial_number, hit)),
            None => blocks.push((block_id, vec![(trial_number, hit)])),
        }
    }

    let mut hits_per_round = Vec::new();
    for (_, mut seq) in blocks {
        seq.sort_by_key(|&(n, _)| n);
        let hits: Vec<bool> = seq.into_iter().map(|(_, h)| h).collect();
        hits_per_round.extend(score_rounds(&hits, round_size, win_hits).hits_per_round);
    }
    RoundScore {
        rounds_total: hits_per_round.len(),
        rounds_won: hits_per_round.iter().filter(|&&h| h >= win_hits).count(),
        hits_per_round,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(per_round: &[usize], size: usize) -> Vec<bool> {
        per_round
            .iter()
            .flat_map(|&h| (0..size).map(move |i| i < h))
            .collect()
    }

    #[test]
    fn test_thirty_trials_six_rounds() {
        let hits = pattern(&[3, 2, 5, 1, 4, 0], 5);
        assert_eq!(hits.len(), 30);
        let score = score_rounds(&hits, 5, 3);
        assert_eq!(score.rounds_total, 6);
        assert_eq!(score.rounds_won, 3);
        assert_eq!(score.hits_per_round, vec![3, 2, 5, 1, 4, 0]);
    }

    #[test]
    fn test_partial_round_counts() {
        let mut hits = pattern(&[3], 5);
        hits.extend([true, true]);
        let score = score_rounds(&hits, 5, 3);
        assert_eq!(score.rounds_total, 2);
        assert_eq!(score.rounds_won, 1);
    }

    #[test]
    fn test_empty_and_zero_size() {
        assert_eq!(score_rounds(&[], 5, 3).rounds_total, 0);
        assert_eq!(score_rounds(&[true], 0, 3).rounds_total, 0);
    }

    #[test]
    fn test_timeout_keeps_its_slot() {
        // Block a: hits on 1, 2, 4; trial 3 timed out; 6..=8 hit.
        let a = [(1, true), (2, true), (3, false), (4, true), (5, false), (6, true), (7, true), (8, true)];
        let trials = a.iter().map(|&(n, h)| ("a", n, h));
        let score = score_blocks(trials, 5, 3);
        assert_eq!(score.hits_per_round, vec![3, 3]);
        assert_eq!(score.rounds_won, 2);
    }

    #[test]
    fn test_rounds_do_not_span_blocks() {
        // Joined, the tail of a and the head of b would fill a single round.
        let mut trials: Vec<(&str, u32, bool)> = (1..=8).map(|n| ("a", n, n > 5)).collect();
        trials.extend((1..=2).map(|n| ("b", n, true)));
        let score = score_blocks(trials, 5, 3);
        assert_eq!(score.rounds_total, 3);
        assert_eq!(score.hits_per_round, vec![0, 3, 2]);
        assert_eq!(score.rounds_won, 1);
    }

    #[test]
    fn test_blocks_sorted_by_trial_number() {
        let trials = vec![("a", 3, false), ("a", 1, true), ("a", 2, true), ("a", 4, true)];
        let score = score_blocks(trials, 3, 2);
        assert_eq!(score.hits_per_round, vec![2, 1]);
    }
}
