//! Outbound notifications: reply email and the budget alert topic.

pub mod mailer;
pub mod topic;

pub use mailer::{Mailer, MailerHandle, OutboundEmail, Outbox, SmtpConfig, SmtpMailer};
pub use topic::{BroadcastTopic, Topic, TopicHandle, TopicMessage};
