//! Optional SMTP delivery of group reports.

use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::debug;

use crate::config::SmtpConfig;

/// Mail the rendered report. Returns `Ok(false)` (a silent skip) when any
/// SMTP setting is missing, so an unconfigured install never errors.
pub fn send_group_report(smtp: &SmtpConfig, group_name: &str, html: &str) -> Result<bool> {
    if smtp.server_host.is_empty()
        || smtp.server_port == 0
        || smtp.user.is_empty()
        || smtp.password.is_empty()
        || smtp.receiver.is_empty()
    {
        debug!("SMTP settings incomplete, skipping mail");
        return Ok(false);
    }

    let message = Message::builder()
        .from(
            format!("noreply <{}>", smtp.user)
                .parse()
                .context("parse sender address")?,
        )
        .to(smtp.receiver.parse().context("parse receiver address")?)
        .subject(format!("taskherd {group_name} report"))
        .header(ContentType::TEXT_HTML)
        .body(html.to_string())
        .context("build report mail")?;

    let transport = SmtpTransport::builder_dangerous(&smtp.server_host)
        .port(smtp.server_port)
        .credentials(Credentials::new(smtp.user.clone(), smtp.password.clone()))
        .build();
    transport.send(&message).context("send report mail")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_settings_skip_silently() {
        let smtp = SmtpConfig::default();
        assert!(!send_group_report(&smtp, "g", "<div/>").unwrap());

        let half = SmtpConfig {
            server_host: "smtp.example.com".into(),
            ..SmtpConfig::default()
        };
        assert!(!send_group_report(&half, "g", "<div/>").unwrap());
    }
}
