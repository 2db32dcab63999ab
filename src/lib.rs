//! Sequence Mailer — scheduled, rate-limited follow-up email sequences.

pub mod config;
pub mod error;
pub mod sequence;
pub mod store;
pub mod tick;
pub mod tracking;
pub mod transport;
