//! SMTP transport via lettre, one pooled connection per sender identity.

use std::collections::HashMap;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use super::{Mailer, OutgoingEmail};
use crate::config::SenderAccount;
use crate::error::{ConfigError, TransportError};

/// A configured sender: its From mailbox and a reusable transport.
struct SenderHandle {
    from: Mailbox,
    domain: String,
    transport: SmtpTransport,
}

/// SMTP mailer keyed by sender identity (lowercased).
pub struct SmtpMailer {
    senders: HashMap<String, SenderHandle>,
}

impl SmtpMailer {
    /// Build transports for every account. Fails on unparsable addresses or
    /// relay hosts so misconfiguration surfaces at startup.
    pub fn new(accounts: &[SenderAccount]) -> Result<Self, ConfigError> {
        let mut senders = HashMap::new();

        for account in accounts {
            let invalid = |message: String| ConfigError::InvalidValue {
                key: format!("sender {}", account.identity),
                message,
            };

            let address: lettre::Address = account
                .identity
                .parse()
                .map_err(|e| invalid(format!("invalid identity address: {e}")))?;
            let domain = address.domain().to_string();
            let from = Mailbox::new(account.display_name.clone(), address);

            let creds = Credentials::new(
                account.username.clone(),
                account.password.expose_secret().to_string(),
            );

            // 465 is implicit TLS; anything else negotiates STARTTLS.
            let builder = if account.smtp_port == 465 {
                SmtpTransport::relay(&account.smtp_host)
            } else {
                SmtpTransport::starttls_relay(&account.smtp_host)
            };
            let builder = builder.map_err(|e| invalid(format!("SMTP relay error: {e}")))?;

            let transport = builder
                .port(account.smtp_port)
                .credentials(creds)
                .build();

            senders.insert(
                account.identity.to_lowercase(),
                SenderHandle {
                    from,
                    domain,
                    transport,
                },
            );
        }

        tracing::info!(count = senders.len(), "SMTP sender identities configured");
        Ok(Self { senders })
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.senders.keys().map(String::as_str)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, identity: &str, email: OutgoingEmail) -> Result<String, TransportError> {
        let sender = self
            .senders
            .get(&identity.to_lowercase())
            .ok_or_else(|| TransportError::Configuration {
                identity: identity.to_string(),
            })?;

        let message_id = format!("<{}@{}>", Uuid::new_v4(), sender.domain);
        let message = build_message(&sender.from, &message_id, &email).map_err(|reason| {
            TransportError::Delivery {
                identity: identity.to_string(),
                reason,
            }
        })?;

        let transport = sender.transport.clone();
        let result = tokio::task::spawn_blocking(move || transport.send(&message)).await;

        match result {
            Ok(Ok(_)) => {
                tracing::info!(from = identity, to = %email.recipient, %message_id, "Email sent");
                Ok(message_id)
            }
            Ok(Err(e)) => Err(TransportError::Delivery {
                identity: identity.to_string(),
                reason: format!("SMTP send failed: {e}"),
            }),
            Err(e) => Err(TransportError::Delivery {
                identity: identity.to_string(),
                reason: format!("SMTP task failed: {e}"),
            }),
        }
    }

    fn display_name(&self, identity: &str) -> Option<String> {
        self.senders
            .get(&identity.to_lowercase())
            .and_then(|s| s.from.name.clone())
    }
}

/// Build the MIME message with threading headers.
fn build_message(from: &Mailbox, message_id: &str, email: &OutgoingEmail) -> Result<Message, String> {
    let to: Mailbox = email
        .recipient
        .parse()
        .map_err(|e| format!("Invalid to address: {e}"))?;

    let mut builder = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(email.subject.clone())
        .message_id(Some(message_id.to_string()))
        .header(ContentType::TEXT_HTML);

    if let Some(in_reply_to) = &email.headers.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    if let Some(references) = &email.headers.references {
        builder = builder.references(references.clone());
    }

    builder
        .body(email.html_body.clone())
        .map_err(|e| format!("Failed to build email: {e}"))
}
