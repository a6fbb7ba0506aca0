use crate::api::CpMember;
use tokio::sync::watch;

/// What a RaftNode currently believes about leadership of its group.
#[derive(Clone, Debug, PartialEq)]
pub enum ElectionStateSnapshot {
    Leader,
    Candidate,
    Follower(CpMember),
    FollowerNoLeader,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        let _ = self.snd.send(new_state);
    }
}

#[derive(Clone)]
pub struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    pub fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }
}
