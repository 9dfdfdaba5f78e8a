//! Negotiation sessions
//!
//! A session pairs two endpoints, drives the offer/answer exchange between
//! them and relays ICE candidates in both directions.

mod negotiation;
mod state;

pub use negotiation::{NegotiationSession, SessionId, SessionSnapshot};
pub use state::{NegotiationMachine, NegotiationState};
