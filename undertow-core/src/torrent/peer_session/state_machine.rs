//! Choke/interest state of an outbound session

/// The (choked, interested) product state from our side of a connection.
///
/// `choked` is whether the remote is choking us; `interested` is whether we
/// told the remote we want its pieces. Connections start choked and not
/// interested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterestState {
    #[default]
    ChokedNotInterested,
    ChokedInterested,
    UnchokedNotInterested,
    UnchokedInterested,
}

impl InterestState {
    fn from_parts(choked: bool, interested: bool) -> Self {
        match (choked, interested) {
            (true, false) => InterestState::ChokedNotInterested,
            (true, true) => InterestState::ChokedInterested,
            (false, false) => InterestState::UnchokedNotInterested,
            (false, true) => InterestState::UnchokedInterested,
        }
    }

    pub fn is_choked(self) -> bool {
        matches!(
            self,
            InterestState::ChokedNotInterested | InterestState::ChokedInterested
        )
    }

    pub fn is_interested(self) -> bool {
        matches!(
            self,
            InterestState::ChokedInterested | InterestState::UnchokedInterested
        )
    }

    /// NOT_INTERESTED -> INTERESTED. Returns true if INTERESTED should go on the wire.
    pub fn send_interested(&mut self) -> bool {
        if self.is_interested() {
            return false;
        }
        *self = Self::from_parts(self.is_choked(), true);
        true
    }

    /// INTERESTED -> NOT_INTERESTED. Returns true if NOT_INTERESTED should go on the wire.
    pub fn send_not_interested(&mut self) -> bool {
        if !self.is_interested() {
            return false;
        }
        *self = Self::from_parts(self.is_choked(), false);
        true
    }

    /// Remote choked us. Idempotent.
    pub fn receive_choke(&mut self) {
        *self = Self::from_parts(true, self.is_interested());
    }

    /// Remote unchoked us.
    pub fn receive_unchoke(&mut self) {
        *self = Self::from_parts(false, self.is_interested());
    }

    /// Only CHOKE/INTERESTED waits for an UNCHOKE before requesting.
    pub fn awaits_unchoke(self) -> bool {
        self == InterestState::ChokedInterested
    }

    /// Requests may only be issued from UNCHOKE/INTERESTED.
    pub fn can_request(self) -> bool {
        self == InterestState::UnchokedInterested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_transitions() {
        let mut state = InterestState::default();

        assert!(state.send_interested());
        assert_eq!(state, InterestState::ChokedInterested);
        assert!(!state.send_interested());
        assert!(state.awaits_unchoke());
        assert!(!state.can_request());

        state.receive_unchoke();
        assert_eq!(state, InterestState::UnchokedInterested);
        assert!(state.can_request());

        assert!(state.send_not_interested());
        assert_eq!(state, InterestState::UnchokedNotInterested);
        assert!(!state.send_not_interested());
    }

    #[test]
    fn test_choke_is_idempotent() {
        let mut state = InterestState::UnchokedInterested;

        state.receive_choke();
        assert_eq!(state, InterestState::ChokedInterested);
        state.receive_choke();
        assert_eq!(state, InterestState::ChokedInterested);
    }

    #[test]
    fn test_unchoke_without_interest_cannot_request() {
        let mut state = InterestState::ChokedNotInterested;

        assert!(!state.awaits_unchoke());
        state.receive_unchoke();
        assert_eq!(state, InterestState::UnchokedNotInterested);
        assert!(!state.can_request());
    }
}
