use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    pub fn invitation(to: &str, frontend_url: &str, token: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "You have been invited".into(),
            body: format!(
                "You have been invited to join the team. Complete your registration: {}/confirmation?token={}",
                frontend_url.trim_end_matches('/'),
                token
            ),
        }
    }

    pub fn password_reset(to: &str, frontend_url: &str, token: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Reset your password".into(),
            body: format!(
                "Follow this link to reset your password: {}/reset-password?token={}",
                frontend_url.trim_end_matches('/'),
                token
            ),
        }
    }
}

/// Outbound notification sender. Delivery outcome is not part of any
/// account operation's result.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: MailMessage) -> anyhow::Result<()>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: MailMessage) -> anyhow::Result<()> {
        info!(to = %message.to, subject = %message.subject, body = %message.body, "mail queued");
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingMailer;
