//! Outbound email contract.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    /// HTML body.
    pub content: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attach_files: Vec<PathBuf>,
}

/// Delivers emails. Implementations talk to SMTP or a provider API.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, email: Email) -> anyhow::Result<()>;
}

#[async_trait]
impl<T> EmailSender for Arc<T>
where
    T: EmailSender + ?Sized,
{
    async fn send_email(&self, email: Email) -> anyhow::Result<()> {
        (**self).send_email(email).await
    }
}

/// Logs emails instead of sending them. For local runs.
#[derive(Debug, Clone, Default)]
pub struct TracingEmailSender;

#[async_trait]
impl EmailSender for TracingEmailSender {
    async fn send_email(&self, email: Email) -> anyhow::Result<()> {
        info!(
            to = ?email.to,
            cc = ?email.cc,
            bcc = ?email.bcc,
            subject = %email.subject,
            attachments = email.attach_files.len(),
            content = %email.content,
            "email not sent (tracing sender)"
        );
        Ok(())
    }
}
