//! Protocol states of a session and the predicates participants wait on.

use super::msg::Message;

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No transaction and no agent waiting.
    Idle,
    /// A transaction is installed; its current header awaits the agent.
    AwaitMsgHdr,
    /// The agent is blocked in a fetch and nothing is queued.
    W4NextRequest,
    /// The agent must pull the current write message's payload.
    AwaitWritePayload,
    /// The agent must push the current read message's payload.
    AwaitReadPayload,
    /// The current message is done and more remain.
    NextMessagePending,
    /// Every message was serviced.
    Ready,
    /// The agent aborted the transaction.
    Aborted,
    /// The session is closing. Terminal.
    Terminated,
}

impl State {
    /// Payload state matching a message's direction.
    pub fn payload_for(msg: &Message) -> State {
        if msg.is_read() {
            State::AwaitReadPayload
        } else {
            State::AwaitWritePayload
        }
    }

    pub fn is_payload(self) -> bool {
        matches!(self, State::AwaitWritePayload | State::AwaitReadPayload)
    }

    /// A header is queued for the agent to fetch.
    pub fn has_pending_header(self) -> bool {
        matches!(self, State::AwaitMsgHdr | State::NextMessagePending)
    }

    /// A transaction is installed and not yet settled.
    pub fn is_in_flight(self) -> bool {
        self.has_pending_header() || self.is_payload()
    }

    /// The transaction settled and awaits collection by its requester.
    pub fn is_outcome(self) -> bool {
        matches!(self, State::Ready | State::Aborted)
    }
}

/// Condition a blocked participant waits for.
pub type Predicate = fn(State) -> bool;

/// Requester may install a transaction.
pub fn admits_request(state: State) -> bool {
    matches!(
        state,
        State::Idle | State::W4NextRequest | State::Terminated
    )
}

/// Requester's transaction has an outcome.
pub fn transfer_settled(state: State) -> bool {
    state.is_outcome() || state == State::Terminated
}

/// Agent may start an address-phase fetch.
pub fn fetch_possible(state: State) -> bool {
    state == State::Idle || state.has_pending_header() || state == State::Terminated
}

/// A requester answered the agent's waiting fetch.
pub fn header_presented(state: State) -> bool {
    state.is_payload() || state == State::Terminated
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [State; 9] = [
        State::Idle,
        State::AwaitMsgHdr,
        State::W4NextRequest,
        State::AwaitWritePayload,
        State::AwaitReadPayload,
        State::NextMessagePending,
        State::Ready,
        State::Aborted,
        State::Terminated,
    ];

    fn matching(pred: Predicate) -> Vec<State> {
        ALL.into_iter().filter(|s| pred(*s)).collect()
    }

    #[test]
    fn test_every_wait_wakes_on_termination() {
        for pred in [
            admits_request as Predicate,
            transfer_settled,
            fetch_possible,
            header_presented,
        ] {
            assert!(pred(State::Terminated));
        }
    }

    #[test]
    fn test_predicate_sets() {
        assert_eq!(
            matching(admits_request),
            vec![State::Idle, State::W4NextRequest, State::Terminated]
        );
        assert_eq!(
            matching(transfer_settled),
            vec![State::Ready, State::Aborted, State::Terminated]
        );
        assert_eq!(
            matching(fetch_possible),
            vec![
                State::Idle,
                State::AwaitMsgHdr,
                State::NextMessagePending,
                State::Terminated
            ]
        );
        assert_eq!(
            matching(header_presented),
            vec![
                State::AwaitWritePayload,
                State::AwaitReadPayload,
                State::Terminated
            ]
        );
    }

    #[test]
    fn test_payload_for_direction() {
        assert_eq!(
            State::payload_for(&Message::read(0x50, 1)),
            State::AwaitReadPayload
        );
        assert_eq!(
            State::payload_for(&Message::write(0x50, vec![0x00])),
            State::AwaitWritePayload
        );
    }
}
