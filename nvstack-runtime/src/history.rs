//! # CAS History Checker
//!
//! Validates that a set of CAS outcomes collected from a run (possibly with
//! crashes and restorations in between) is explainable by one linear chain
//! of successful transitions starting at the register's initial value.
//!
//! Two checks are provided:
//!
//! - [`check_history`]: successful transitions, viewed as edges
//!   `value_from -> value_to`, must form an Eulerian path from the initial
//!   value (or a circuit).
//! - [`check_history_ordered`]: a stricter check for histories in which
//!   every CAS installs a fresh value. The successful transitions must form
//!   a single chain from the initial value, and each thread's successful
//!   CASes must appear along it in the order that thread issued them.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// One observed CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CasOutcome {
    /// Expected value.
    pub value_from: u32,
    /// Value the CAS tried to install.
    pub value_to: u32,
    /// Whether it succeeded.
    pub result: bool,
}

impl CasOutcome {
    /// Outcome of `cas(value_from -> value_to)`.
    pub const fn new(value_from: u32, value_to: u32, result: bool) -> Self {
        Self {
            value_from,
            value_to,
            result,
        }
    }
}

/// Reasons a history is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// In and out degrees of the successful transitions do not allow a path.
    #[error("successful transitions do not form a single path from {init}")]
    Unbalanced {
        /// Initial register value.
        init: u32,
    },

    /// A CAS expected and installed the same value.
    #[error("cas {0} -> {0} is a self-loop")]
    SelfLoop(u32),

    /// A CAS tried to install the initial value.
    #[error("cas installs the initial value {0}")]
    InstallsInitial(u32),

    /// Two CASes tried to install the same value.
    #[error("value {0} is installed by more than one cas")]
    DuplicateTarget(u32),

    /// More than one successful CAS left the same value.
    #[error("value {0} was replaced by more than one successful cas")]
    Branch(u32),

    /// Some successful CAS is not reachable from the initial value.
    #[error("{unreached} successful cas are not reachable from {init}")]
    Disconnected {
        /// Initial register value.
        init: u32,
        /// Number of successful CASes off the chain.
        unreached: usize,
    },

    /// No CAS succeeded, yet one expected the initial value and must have
    /// succeeded.
    #[error("cas from initial value {0} failed although nothing changed it")]
    MissedInitial(u32),

    /// A thread's successful CASes appear out of order on the chain.
    #[error("thread {thread} performed {first:?} before {second:?} but the chain orders them the other way")]
    OutOfOrder {
        /// Index of the thread in the input.
        thread: usize,
        /// Earlier CAS in program order.
        first: CasOutcome,
        /// Later CAS in program order.
        second: CasOutcome,
    },
}

/// Check that the successful transitions in `outcomes` form one Eulerian
/// path starting at `init`.
pub fn check_history(outcomes: &[CasOutcome], init: u32) -> Result<(), HistoryError> {
    let mut balance: HashMap<u32, i64> = HashMap::new();
    for outcome in outcomes.iter().filter(|o| o.result) {
        *balance.entry(outcome.value_from).or_default() += 1;
        *balance.entry(outcome.value_to).or_default() -= 1;
    }

    let mut start = None;
    let mut finish = None;
    for (&value, &delta) in &balance {
        match delta {
            0 => {}
            1 if start.is_none() => start = Some(value),
            -1 if finish.is_none() => finish = Some(value),
            _ => return Err(HistoryError::Unbalanced { init }),
        }
    }

    match (start, finish) {
        (None, None) => Ok(()),
        (Some(start), Some(finish)) if start == init && finish != init => Ok(()),
        _ => Err(HistoryError::Unbalanced { init }),
    }
}

/// Restricted check over per-thread histories in program order.
pub fn check_history_ordered(per_thread: &[Vec<CasOutcome>], init: u32) -> Result<(), HistoryError> {
    let mut seen_targets = HashSet::new();
    let mut next: HashMap<u32, u32> = HashMap::new();
    let mut successes = 0;

    for outcome in per_thread.iter().flatten() {
        if outcome.value_from == outcome.value_to {
            return Err(HistoryError::SelfLoop(outcome.value_to));
        }
        if outcome.value_to == init {
            return Err(HistoryError::InstallsInitial(init));
        }
        if !seen_targets.insert(outcome.value_to) {
            return Err(HistoryError::DuplicateTarget(outcome.value_to));
        }
        if outcome.result {
            successes += 1;
            if next.insert(outcome.value_from, outcome.value_to).is_some() {
                return Err(HistoryError::Branch(outcome.value_from));
            }
        }
    }

    if successes == 0 {
        return match per_thread.iter().flatten().find(|o| o.value_from == init) {
            Some(_) => Err(HistoryError::MissedInitial(init)),
            None => Ok(()),
        };
    }

    // Walk the chain and number its edges.
    let mut position: HashMap<(u32, u32), usize> = HashMap::new();
    let mut current = init;
    while let Some(&to) = next.get(&current) {
        position.insert((current, to), position.len());
        current = to;
    }
    if position.len() != successes {
        return Err(HistoryError::Disconnected {
            init,
            unreached: successes.saturating_sub(position.len()),
        });
    }

    for (thread, outcomes) in per_thread.iter().enumerate() {
        let succeeded: Vec<&CasOutcome> = outcomes.iter().filter(|o| o.result).collect();
        for pair in succeeded.windows(2) {
            let (Some(first), Some(second)) = (
                position.get(&(pair[0].value_from, pair[0].value_to)),
                position.get(&(pair[1].value_from, pair[1].value_to)),
            ) else {
                continue;
            };
            if first >= second {
                return Err(HistoryError::OutOfOrder {
                    thread,
                    first: *pair[0],
                    second: *pair[1],
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cas(from: u32, to: u32, result: bool) -> CasOutcome {
        CasOutcome::new(from, to, result)
    }

    #[test]
    fn test_eulerian_path() {
        let history = [cas(1, 2, true), cas(2, 3, true), cas(3, 1, true), cas(1, 4, true)];
        assert!(check_history(&history, 1).is_ok());
        assert!(check_history(&history, 2).is_err());
    }

    #[test]
    fn test_eulerian_empty_and_circuit() {
        assert!(check_history(&[], 5).is_ok());
        assert!(check_history(&[cas(1, 2, false)], 1).is_ok());
        assert!(check_history(&[cas(1, 2, true), cas(2, 1, true)], 1).is_ok());
    }

    #[test]
    fn test_eulerian_rejects_two_branches() {
        let history = [cas(1, 2, true), cas(1, 3, true)];
        assert_eq!(
            check_history(&history, 1),
            Err(HistoryError::Unbalanced { init: 1 })
        );
    }

    #[test]
    fn test_ordered_sequential() {
        let history = vec![vec![cas(3, 5, false), cas(1, 2, true), cas(2, 7, true)]];
        assert!(check_history_ordered(&history, 1).is_ok());
    }

    #[test]
    fn test_ordered_no_success() {
        assert!(check_history_ordered(&[vec![cas(3, 5, false), cas(2, 4, false)]], 1).is_ok());
        assert_eq!(
            check_history_ordered(&[vec![cas(1, 5, false)]], 1),
            Err(HistoryError::MissedInitial(1))
        );
    }

    #[test]
    fn test_ordered_parallel() {
        let history = vec![
            vec![cas(3, 5, false), cas(1, 2, true), cas(7, 9, true)],
            vec![cas(2, 7, true), cas(7, 8, false), cas(9, 10, true)],
        ];
        assert!(check_history_ordered(&history, 1).is_ok());
    }

    #[test]
    fn test_ordered_parallel_out_of_order() {
        let history = vec![
            vec![cas(3, 5, false), cas(7, 9, true), cas(1, 2, true)],
            vec![cas(2, 7, true), cas(7, 8, false), cas(9, 10, true)],
        ];
        assert!(matches!(
            check_history_ordered(&history, 1),
            Err(HistoryError::OutOfOrder { thread: 0, .. })
        ));
    }

    #[test]
    fn test_ordered_structural_errors() {
        assert_eq!(
            check_history_ordered(&[vec![cas(4, 4, false)]], 1),
            Err(HistoryError::SelfLoop(4))
        );
        assert_eq!(
            check_history_ordered(&[vec![cas(4, 1, false)]], 1),
            Err(HistoryError::InstallsInitial(1))
        );
        assert_eq!(
            check_history_ordered(&[vec![cas(1, 2, true)], vec![cas(3, 2, false)]], 1),
            Err(HistoryError::DuplicateTarget(2))
        );
        assert!(matches!(
            check_history_ordered(&[vec![cas(1, 2, true), cas(5, 6, true)]], 1),
            Err(HistoryError::Disconnected { unreached: 1, .. })
        ));
        assert!(matches!(
            check_history_ordered(&[vec![cas(3, 4, true)]], 1),
            Err(HistoryError::Disconnected { unreached: 1, .. })
        ));
    }
}
