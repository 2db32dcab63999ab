//! Outbound mail transport abstraction.

pub mod smtp;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::sequence::composer::ThreadHeaders;

pub use smtp::SmtpMailer;

/// A fully composed message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub headers: ThreadHeaders,
}

/// Sends mail on behalf of configured sender identities.
///
/// Returns the message identifier assigned to the delivered message.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, identity: &str, email: OutgoingEmail) -> Result<String, TransportError>;

    /// Human-readable name of the identity, used in quoted-reply headers.
    fn display_name(&self, _identity: &str) -> Option<String> {
        None
    }
}
