//! Offer/answer state machine
//!
//! Pure bookkeeping, no I/O. The session driver feeds it completions and
//! acts on the transitions it reports.

use crate::description::{DescriptionTarget, SdpType, SessionDescription};
use crate::endpoint::EndpointId;
use crate::{Error, Result};
use std::fmt;

/// Negotiation session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    /// Offer created on the local endpoint
    OfferCreated,
    /// Offer set as local description on Local and remote description on Remote
    OfferApplied,
    /// Answer created on the remote endpoint
    AnswerCreated,
    /// Answer set on both endpoints
    Negotiated,
    Failed,
    Closed,
}

impl NegotiationState {
    /// No further negotiation progress is possible
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            NegotiationState::Negotiated | NegotiationState::Failed | NegotiationState::Closed
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferCreated => "offer-created",
            NegotiationState::OfferApplied => "offer-applied",
            NegotiationState::AnswerCreated => "answer-created",
            NegotiationState::Negotiated => "negotiated",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Completion flags for the two independent set operations of one description
#[derive(Debug, Default, Clone, Copy)]
struct SetPair {
    /// set-local on the producing endpoint
    producer: bool,
    /// set-remote on the consuming endpoint
    consumer: bool,
}

impl SetPair {
    fn done(&self) -> bool {
        self.producer && self.consumer
    }
}

#[derive(Debug)]
pub struct NegotiationMachine {
    state: NegotiationState,
    offer_requested: bool,
    offer_sets: SetPair,
    answer_sets: SetPair,
}

impl Default for NegotiationMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationMachine {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Idle,
            offer_requested: false,
            offer_sets: SetPair::default(),
            answer_sets: SetPair::default(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Accept a create-offer request
    ///
    /// Only one offer per session; a request while one is in flight is
    /// rejected as well.
    pub fn begin_offer(&mut self) -> Result<()> {
        if self.state != NegotiationState::Idle || self.offer_requested {
            return Err(Error::InvalidState(format!(
                "create-offer requires an idle session (state: {}{})",
                self.state,
                if self.offer_requested {
                    ", offer in flight"
                } else {
                    ""
                }
            )));
        }
        self.offer_requested = true;
        Ok(())
    }

    /// Idle -> OfferCreated
    pub fn offer_created(&mut self, offer: &SessionDescription) -> Result<()> {
        self.expect(NegotiationState::Idle, "offer created")?;
        if offer.sdp_type() != SdpType::Offer {
            return Err(Error::InvalidState(format!(
                "expected an offer, got {}",
                offer.sdp_type()
            )));
        }
        self.state = NegotiationState::OfferCreated;
        Ok(())
    }

    /// OfferApplied -> AnswerCreated
    pub fn answer_created(&mut self, answer: &SessionDescription) -> Result<()> {
        self.expect(NegotiationState::OfferApplied, "answer created")?;
        if answer.sdp_type() != SdpType::Answer {
            return Err(Error::InvalidState(format!(
                "expected an answer, got {}",
                answer.sdp_type()
            )));
        }
        self.state = NegotiationState::AnswerCreated;
        Ok(())
    }

    /// Record a successful set-description
    ///
    /// Returns the new state when this completion finished a pair.
    pub fn description_set(
        &mut self,
        endpoint: EndpointId,
        target: DescriptionTarget,
    ) -> Result<Option<NegotiationState>> {
        use crate::description::DescriptionTarget::{Local as SetLocal, Remote as SetRemote};
        use crate::endpoint::EndpointId::{Local, Remote};

        // The offer is produced on Local, the answer on Remote
        let for_offer = matches!((endpoint, target), (Local, SetLocal) | (Remote, SetRemote));
        let (expected, next) = if for_offer {
            (NegotiationState::OfferCreated, NegotiationState::OfferApplied)
        } else {
            (NegotiationState::AnswerCreated, NegotiationState::Negotiated)
        };

        if self.state != expected {
            return Err(Error::InvalidState(format!(
                "{} {} description set in state {}",
                endpoint, target, self.state
            )));
        }

        let pair = if for_offer {
            &mut self.offer_sets
        } else {
            &mut self.answer_sets
        };
        match target {
            SetLocal => pair.producer = true,
            SetRemote => pair.consumer = true,
        }

        if pair.done() {
            self.state = next;
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    /// Any state except Closed -> Failed; returns whether it transitioned
    pub fn fail(&mut self) -> bool {
        match self.state {
            NegotiationState::Failed | NegotiationState::Closed => false,
            _ => {
                self.state = NegotiationState::Failed;
                true
            }
        }
    }

    /// -> Closed; returns false if already closed
    pub fn close(&mut self) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }
        self.state = NegotiationState::Closed;
        true
    }

    fn expect(&self, expected: NegotiationState, what: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState(format!(
                "{} in state {} (expected {})",
                what, self.state, expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::DescriptionTarget::{Local as SetLocal, Remote as SetRemote};
    use crate::endpoint::EndpointId::{Local, Remote};

    fn offered() -> NegotiationMachine {
        let mut machine = NegotiationMachine::new();
        machine.begin_offer().unwrap();
        machine
            .offer_created(&SessionDescription::offer("O1"))
            .unwrap();
        machine
    }

    fn run(
        sets: [(EndpointId, DescriptionTarget); 2],
        answer_sets: [(EndpointId, DescriptionTarget); 2],
    ) -> NegotiationState {
        let mut machine = offered();
        assert_eq!(machine.description_set(sets[0].0, sets[0].1).unwrap(), None);
        assert_eq!(
            machine.description_set(sets[1].0, sets[1].1).unwrap(),
            Some(NegotiationState::OfferApplied)
        );
        machine
            .answer_created(&SessionDescription::answer("A1"))
            .unwrap();
        assert_eq!(
            machine.description_set(answer_sets[0].0, answer_sets[0].1).unwrap(),
            None
        );
        machine
            .description_set(answer_sets[1].0, answer_sets[1].1)
            .unwrap();
        machine.state()
    }

    #[test]
    fn test_negotiated_regardless_of_set_order() {
        let offer_orders = [
            [(Local, SetLocal), (Remote, SetRemote)],
            [(Remote, SetRemote), (Local, SetLocal)],
        ];
        let answer_orders = [
            [(Remote, SetLocal), (Local, SetRemote)],
            [(Local, SetRemote), (Remote, SetLocal)],
        ];

        for offer_order in offer_orders {
            for answer_order in answer_orders {
                assert_eq!(run(offer_order, answer_order), NegotiationState::Negotiated);
            }
        }
    }

    #[test]
    fn test_offer_only_from_idle() {
        let mut machine = NegotiationMachine::new();
        machine.begin_offer().unwrap();
        assert!(matches!(machine.begin_offer(), Err(Error::InvalidState(_))));

        let mut machine = offered();
        assert!(matches!(machine.begin_offer(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_answer_requires_offer_applied() {
        let mut machine = offered();
        machine.description_set(Local, SetLocal).unwrap();
        let result = machine.answer_created(&SessionDescription::answer("A1"));
        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(machine.state(), NegotiationState::OfferCreated);
    }

    #[test]
    fn test_answer_set_rejected_before_answer_exists() {
        let mut machine = offered();
        assert!(machine.description_set(Remote, SetLocal).is_err());
        assert!(machine.description_set(Local, SetRemote).is_err());
    }

    #[test]
    fn test_duplicate_completion_does_not_advance() {
        let mut machine = offered();
        assert_eq!(machine.description_set(Local, SetLocal).unwrap(), None);
        assert_eq!(machine.description_set(Local, SetLocal).unwrap(), None);
        assert_eq!(machine.state(), NegotiationState::OfferCreated);
    }

    #[test]
    fn test_fail_and_close() {
        let mut machine = offered();
        assert!(machine.fail());
        assert!(!machine.fail());
        assert_eq!(machine.state(), NegotiationState::Failed);
        assert!(machine.description_set(Local, SetLocal).is_err());

        assert!(machine.close());
        assert!(!machine.close());
        assert!(!machine.fail());
        assert_eq!(machine.state(), NegotiationState::Closed);
    }

    #[test]
    fn test_second_offer_description_rejected() {
        let mut machine = offered();
        let result = machine.offer_created(&SessionDescription::offer("O2"));
        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(machine.state(), NegotiationState::OfferCreated);
    }
}
