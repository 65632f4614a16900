//! Leaderless total-order agreement.
//!
//! Submodules, in data-flow order: [`message`] defines the protocol
//! vocabulary, [`txn`] the queued unit, [`queue`] holds transactions until
//! they are both ordered and safe, [`safety`] tracks peer
//! acknowledgements, [`faults`] settles the horizon of failed sites by
//! quorum, [`recovery`] brings rejoining sites back, and [`engine`] owns
//! all of it in one event loop.

pub mod engine;
pub mod faults;
pub mod message;
pub mod queue;
pub mod recovery;
pub mod safety;
pub mod txn;

#[cfg(test)]
mod tests;
