use async_trait::async_trait;
use lettre::{
    address::AddressError,
    message::{Mailbox, MultiPart},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use thiserror::Error;

use crate::config::SmtpSettings;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Invalid Address: {0}")]
    InvalidEmailAddress(String),
    #[error("Send error: {0}")]
    SendError(String),
}

impl From<AddressError> for MailError {
    fn from(error: AddressError) -> Self {
        MailError::InvalidEmailAddress(error.to_string())
    }
}

impl From<lettre::error::Error> for MailError {
    fn from(error: lettre::error::Error) -> Self {
        MailError::SendError(error.to_string())
    }
}

impl From<lettre::transport::smtp::Error> for MailError {
    fn from(error: lettre::transport::smtp::Error) -> Self {
        MailError::SendError(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

impl OutgoingEmail {
    pub fn new(to: &str, subject: &str, text: String, html: Option<String>) -> Self {
        Self {
            to: to.to_string(),
            subject: single_line(subject),
            text,
            html,
        }
    }
}

/// Email headers cannot carry line breaks.
pub fn single_line(subject: &str) -> String {
    subject.lines().map(str::trim).collect::<Vec<_>>().join("")
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError>;
}

#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings, from: &str) -> Result<Self, MailError> {
        let sender: Mailbox = from.parse()?;

        let mut builder = if settings.tls_disabled {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
                .port(settings.port)
        } else {
            let tls = TlsParameters::new(settings.host.clone())?;
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?
                .port(settings.port)
                .tls(Tls::Required(tls))
        };
        if let Some(credentials) = smtp_credentials(settings) {
            builder = builder.credentials(credentials);
        }
        let transport = builder.build();

        Ok(Self { transport, sender })
    }
}

fn smtp_credentials(settings: &SmtpSettings) -> Option<Credentials> {
    match (settings.username.as_ref(), settings.password.as_ref()) {
        (Some(username), Some(password)) => {
            Some(Credentials::new(username.clone(), password.clone()))
        }
        _ => None,
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        let recipient: Mailbox = email.to.parse()?;
        let builder = Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(email.subject);

        let message = match email.html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(email.text, html))?,
            None => builder.body(email.text)?,
        };

        self.transport.send(message).await?;
        Ok(())
    }
}

/// Used when no SMTP server is configured; mail is written to the log.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            body = %email.text,
            "email not sent (SMTP not configured)"
        );
        Ok(())
    }
}
