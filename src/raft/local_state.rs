use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Copy, Clone, PartialOrd, PartialEq, Eq, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState holds what Raft requires to survive a restart: the current term and the
/// vote cast in it. Store methods behave like CAS operations and return true if state changed.
pub(crate) trait PersistentLocalState: Send {
    /// Set current term to `new_term` iff it is larger than current term. Clears the vote.
    fn store_term_if_increased(&mut self, new_term: Term) -> bool;

    /// Store our vote iff `expected_current_term` is still the current term and we have not
    /// voted in it yet.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: Uuid) -> bool;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Term;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Uuid>);
}

// Held in memory only. A CP member that restarts rejoins as a new member, so nothing here has
// to outlive the process.
pub(crate) struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Uuid>,
    my_id: Uuid,
}

impl VolatileLocalState {
    pub(crate) fn new(my_id: Uuid) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_id,
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> bool {
        if new_term <= self.current_term {
            return false;
        }

        self.current_term = new_term;
        self.voted_for_this_term = None;
        true
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: Uuid) -> bool {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return false;
        }

        self.voted_for_this_term.replace(vote);
        true
    }

    fn increment_term_and_vote_for_self(&mut self) -> Term {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_id);

        self.current_term
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Uuid>) {
        (self.current_term, self.voted_for_this_term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_once_per_term() {
        let me = Uuid::new_v4();
        let candidate_a = Uuid::new_v4();
        let candidate_b = Uuid::new_v4();
        let mut state = VolatileLocalState::new(me);

        assert!(state.store_term_if_increased(Term::new(3)));
        assert!(!state.store_term_if_increased(Term::new(3)));
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(2), candidate_a));
        assert!(state.store_vote_for_term_if_unvoted(Term::new(3), candidate_a));
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(3), candidate_b));
        assert_eq!(state.voted_for_current_term(), (Term::new(3), Some(candidate_a)));

        // A newer term clears the vote.
        assert!(state.store_term_if_increased(Term::new(4)));
        assert_eq!(state.voted_for_current_term(), (Term::new(4), None));

        assert_eq!(state.increment_term_and_vote_for_self(), Term::new(5));
        assert_eq!(state.voted_for_current_term(), (Term::new(5), Some(me)));
    }
}
