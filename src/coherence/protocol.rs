use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherenceProtocol {
    Mesi,
    #[default]
    Moesi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LineState {
    #[default]
    Invalid,
    Shared,
    Exclusive,
    Owned,
    Modified,
}

impl LineState {
    pub fn is_valid(self) -> bool {
        !matches!(self, LineState::Invalid)
    }

    /// Local writes may proceed without a coherency round.
    pub fn is_writable(self) -> bool {
        matches!(self, LineState::Exclusive | LineState::Modified)
    }

    /// The holder's copy may be newer than the next level.
    pub fn is_owner(self) -> bool {
        matches!(self, LineState::Modified | LineState::Owned)
    }

    /// No other cache may hold a valid copy while one cache is in this state.
    pub fn is_exclusive(self) -> bool {
        matches!(self, LineState::Exclusive | LineState::Modified)
    }

    pub fn short(self) -> char {
        match self {
            LineState::Invalid => 'I',
            LineState::Shared => 'S',
            LineState::Exclusive => 'E',
            LineState::Owned => 'O',
            LineState::Modified => 'M',
        }
    }
}

/// Kind of access that triggered a coherency round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnoopKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTransition {
    pub next: LineState,
    // the holder hands its copy to the requester
    pub supplies: bool,
    // the holder's dirty copy is written to the next level
    pub writeback: bool,
}

/// Transition of a peer cache's copy when another cache's request is snooped.
pub fn remote_transition(
    protocol: CoherenceProtocol,
    state: LineState,
    kind: SnoopKind,
    dirty: bool,
) -> RemoteTransition {
    use LineState::*;
    let (next, supplies, writeback) = match (state, kind) {
        (Invalid, _) => (Invalid, false, false),
        (Shared, SnoopKind::Read) => (Shared, false, false),
        (Exclusive, SnoopKind::Read) => (Shared, false, false),
        (Modified, SnoopKind::Read) => match protocol {
            CoherenceProtocol::Moesi => (Owned, true, false),
            CoherenceProtocol::Mesi => (Shared, true, dirty),
        },
        (Owned, SnoopKind::Read) => (Owned, true, false),
        (Shared | Exclusive, SnoopKind::Write) => (Invalid, false, false),
        (Modified | Owned, SnoopKind::Write) => (Invalid, true, dirty),
    };
    RemoteTransition {
        next,
        supplies,
        writeback,
    }
}

/// State a requester ends in once its round completes.
pub fn requester_state(kind: SnoopKind, other_holders: bool) -> LineState {
    match kind {
        SnoopKind::Write => LineState::Modified,
        SnoopKind::Read if other_holders => LineState::Shared,
        SnoopKind::Read => LineState::Exclusive,
    }
}

/// Whether a local access can be served from the current state without a round.
pub fn local_hit(state: LineState, kind: SnoopKind) -> bool {
    match kind {
        SnoopKind::Read => state.is_valid(),
        SnoopKind::Write => state.is_writable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LineState::*;

    #[test]
    fn exclusive_downgrades_on_remote_read_without_data() {
        let t = remote_transition(CoherenceProtocol::Mesi, Exclusive, SnoopKind::Read, false);
        assert_eq!(Shared, t.next);
        assert!(!t.supplies);
        assert!(!t.writeback);
    }

    #[test]
    fn modified_remote_read_depends_on_protocol() {
        let moesi = remote_transition(CoherenceProtocol::Moesi, Modified, SnoopKind::Read, true);
        assert_eq!(Owned, moesi.next);
        assert!(moesi.supplies);
        assert!(!moesi.writeback);

        let mesi = remote_transition(CoherenceProtocol::Mesi, Modified, SnoopKind::Read, true);
        assert_eq!(Shared, mesi.next);
        assert!(mesi.supplies);
        assert!(mesi.writeback);
    }

    #[test]
    fn owners_invalidate_and_write_back_on_remote_write() {
        for state in [Modified, Owned] {
            let t = remote_transition(CoherenceProtocol::Moesi, state, SnoopKind::Write, true);
            assert_eq!(Invalid, t.next);
            assert!(t.supplies);
            assert!(t.writeback);
        }
        let clean = remote_transition(CoherenceProtocol::Moesi, Modified, SnoopKind::Write, false);
        assert!(!clean.writeback);
    }

    #[test]
    fn sharers_invalidate_on_remote_write() {
        for state in [Shared, Exclusive] {
            let t = remote_transition(CoherenceProtocol::Mesi, state, SnoopKind::Write, false);
            assert_eq!(Invalid, t.next);
            assert!(!t.supplies);
        }
    }

    #[test]
    fn requester_state_follows_other_holders() {
        assert_eq!(Exclusive, requester_state(SnoopKind::Read, false));
        assert_eq!(Shared, requester_state(SnoopKind::Read, true));
        assert_eq!(Modified, requester_state(SnoopKind::Write, true));
    }

    #[test]
    fn writes_need_exclusive_permission() {
        assert!(local_hit(Shared, SnoopKind::Read));
        assert!(!local_hit(Shared, SnoopKind::Write));
        assert!(!local_hit(Owned, SnoopKind::Write));
        assert!(local_hit(Exclusive, SnoopKind::Write));
        assert!(!local_hit(Invalid, SnoopKind::Read));
    }
}
