use crate::backup::arcvec::ArcVec;
use crate::backup::function_path;
use crate::backup::notifications::Notification;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use bon::Builder;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Display;
use std::ops::Deref;
use validator::Validate;

/// Sends the run report by mail. The password is a [`RedactedString`] so the
/// config can be logged or dumped without leaking it.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct SmtpNotificationConfig {
    #[builder(into)]
    host: String,
    /// Overrides the mode's standard port.
    port: Option<u16>,
    #[builder(into)]
    smtp_mode: SmtpMode,
    #[builder(into)]
    from: Mailbox,
    #[validate(length(min = 1))]
    #[builder(into)]
    to: ArcVec<Mailbox>,
    /// Relays that accept anonymous submission need neither.
    #[builder(into)]
    username: Option<String>,
    #[builder(into)]
    password: Option<RedactedString>,
}

/// - `Unsecured`: plain text, for local relays only
/// - `Ssl`: implicit TLS
/// - `StartTls`: plain text upgraded to TLS
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SmtpMode {
    Unsecured,
    Ssl,
    StartTls,
}

impl SmtpNotificationConfig {
    #[named]
    fn build_message<D1: Display, D2: Display>(&self, topic: D1, msg: D2) -> Result<Message> {
        self.to
            .iter()
            .fold(Message::builder(), |email, send_to| email.to(send_to.clone()))
            .from(self.from.clone())
            .subject(topic.to_string())
            .header(ContentType::TEXT_PLAIN)
            .body(msg.to_string())
            .map_err(Error::from)
            .add_msg(format!(
                "Fail to build notification email from {:?} to {:?}",
                self.from,
                self.to.deref()
            ))
            .add_fn_name(function_path!())
    }

    #[named]
    fn build_mailer(&self) -> Result<SmtpTransport> {
        let mut builder = match self.smtp_mode {
            SmtpMode::Unsecured => Ok(SmtpTransport::builder_dangerous(self.host.as_str())),
            SmtpMode::Ssl => SmtpTransport::relay(self.host.as_str()),
            SmtpMode::StartTls => SmtpTransport::starttls_relay(self.host.as_str()),
        }
        .map_err(Error::from)
        .add_msg(format!(
            "Failed to build smtp client for host: {:?} with mode {:?}",
            self.host, self.smtp_mode
        ))
        .add_fn_name(function_path!())?;

        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.inner().to_string(),
            ));
        }
        Ok(builder.build())
    }
}

impl Notification for SmtpNotificationConfig {
    #[named]
    fn send<D1: Display, D2: Display>(&self, topic: D1, msg: D2) -> Result<()> {
        tracing::info!(
            "Started smtp email notification from {:?} to {:?}",
            self.from,
            self.to.deref()
        );
        let email = self.build_message(topic, msg)?;
        let mailer = self.build_mailer()?;

        let response = mailer
            .send(&email)
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        if response.is_positive() {
            Ok(())
        } else {
            let error_vec = response
                .message()
                .map(|m| Error::smtp_send_error(m.to_owned()))
                .collect_vec();
            Err(Error::lots_of_error(error_vec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: String, port: Option<u16>, to: Vec<Mailbox>) -> SmtpNotificationConfig {
        SmtpNotificationConfig::builder()
            .host(host)
            .maybe_port(port)
            .smtp_mode(SmtpMode::Unsecured)
            .from("backup@example.com".parse::<Mailbox>().unwrap())
            .to(to)
            .username("backup".to_string())
            .password(RedactedString::builder().inner("testpass").build())
            .build()
    }

    #[test]
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn test_smtp_notification_send() {
        // Needs a local port; skipped on CI runners that forbid it
        if std::env::var("CI").is_ok() {
            return;
        }

        let server = maik::MockServer::builder().no_verify_credentials().build();
        let config = config(
            server.host().to_string(),
            Some(server.port()),
            vec!["ops@example.com".parse::<Mailbox>().unwrap()],
        );

        server.start();
        std::thread::sleep(std::time::Duration::from_millis(100));

        let result = config.send("[k_rsync_backup] SUCCESS", "web1: SUCCESS");

        std::thread::sleep(std::time::Duration::from_millis(200));

        if result.is_ok() {
            let assertion = maik::MailAssertion::new()
                .recipients_are(["ops@example.com"])
                .body_is("web1: SUCCESS");
            assert!(server.assert(assertion));
        }
    }

    #[test]
    fn test_smtp_notification_validation() {
        let valid = config(
            "smtp.example.com".to_string(),
            None,
            vec!["ops@example.com".parse::<Mailbox>().unwrap()],
        );
        assert!(valid.validate().is_ok());

        let invalid = config("smtp.example.com".to_string(), None, vec![]);
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_smtp_mode_serialization() {
        for (mode, expected) in [
            (SmtpMode::Unsecured, "\"Unsecured\""),
            (SmtpMode::Ssl, "\"Ssl\""),
            (SmtpMode::StartTls, "\"StartTls\""),
        ] {
            let serialized = serde_json::to_string(&mode).unwrap();
            assert_eq!(serialized, expected);
            let deserialized: SmtpMode = serde_json::from_str(&serialized).unwrap();
            assert_eq!(deserialized, mode);
        }
    }

    #[test]
    fn test_password_never_serialized() {
        let config = config(
            "smtp.example.com".to_string(),
            Some(2525),
            vec!["ops@example.com".parse::<Mailbox>().unwrap()],
        );
        let yaml = serde_yml::to_string(&config).unwrap();
        assert!(!yaml.contains("testpass"));
        assert!(yaml.contains("port: 2525"));
    }
}
