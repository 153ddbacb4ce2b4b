use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::extract::Item;
use crate::settings::EmailConfig;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to build email: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP send failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("missing email setting: {0}")]
    Missing(&'static str),
}

/// Delivers one message covering a batch of new items.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, items: &[Item]) -> Result<(), NotifyError>;
}

/// New items found on one target during one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationBatch {
    pub target_name: String,
    pub items: Vec<Item>,
}

impl NotificationBatch {
    pub fn new(target_name: &str) -> Self {
        Self {
            target_name: target_name.to_string(),
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn subject(&self, prefix: &str) -> String {
        format!("{}: {} ({} new)", prefix, self.target_name, self.items.len())
    }
}

pub fn render_html(subject: &str, items: &[Item]) -> String {
    let mut body = format!("<h3>{}</h3><ul>", escape_html(subject));
    for item in items {
        body.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>",
            escape_html(&item.url),
            escape_html(&item.title)
        ));
    }
    body.push_str("</ul>");
    body
}

pub fn render_text(subject: &str, items: &[Item]) -> String {
    let mut body = format!("{}\n\n", subject);
    for item in items {
        body.push_str(&format!("- {}\n  {}\n", item.title, item.url));
    }
    body
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

// ── Email ──

pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailNotifier {
    pub fn new(cfg: &EmailConfig) -> Result<Self, NotifyError> {
        let host = cfg
            .smtp_server
            .as_deref()
            .ok_or(NotifyError::Missing("email.smtp_server"))?;
        let sender = cfg
            .sender_email
            .as_deref()
            .ok_or(NotifyError::Missing("email.sender_email"))?;
        let recipient = cfg
            .recipient_email
            .as_deref()
            .ok_or(NotifyError::Missing("email.recipient_email"))?;

        let mut builder = if cfg.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(cfg.smtp_port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(cfg.smtp_port)
        };

        if let Some(password) = &cfg.sender_password {
            builder = builder.credentials(Credentials::new(sender.to_string(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from: sender.parse()?,
            to: recipient.parse()?,
        })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, subject: &str, items: &[Item]) -> Result<(), NotifyError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(
                render_text(subject, items),
                render_html(subject, items),
            ))?;

        self.transport.send(email).await?;
        info!(to = %self.to, items = items.len(), "Email sent");
        Ok(())
    }
}

// ── Disabled ──

/// Used when email is switched off: accepts everything.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, subject: &str, items: &[Item]) -> Result<(), NotifyError> {
        debug!(subject, items = items.len(), "Notifications disabled, skipping");
        Ok(())
    }
}

pub fn from_config(cfg: &EmailConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    if cfg.enabled {
        Ok(Arc::new(EmailNotifier::new(cfg)?))
    } else {
        Ok(Arc::new(DisabledNotifier))
    }
}
