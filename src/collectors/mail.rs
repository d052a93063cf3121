//! Email-source collector.
//!
//! Reads one raw email message (typically from standard input, as fed
//! by an MDA rule), extracts the body via the implementor's hook, and
//! stamps `mail_time`/`mail_subject` into the message's `meta` headers.

use std::collections::BTreeMap;
use std::io::Read;

use chrono::DateTime;
use mailparse::{MailHeaderMap, ParsedMail};

use super::{CollectorError, CollectorSpec, RawPublisher, Result};

/// Extracts publishable data out of a parsed email.
pub trait EmailExtractor: Send {
    /// The data body; e.g. a decoded attachment or the text part.
    fn extract_body(&self, mail: &ParsedMail<'_>) -> Result<Vec<u8>>;
}

/// Extractor returning the first text part (or the top-level body).
pub struct PlainTextExtractor;

impl EmailExtractor for PlainTextExtractor {
    fn extract_body(&self, mail: &ParsedMail<'_>) -> Result<Vec<u8>> {
        let part = mail
            .subparts
            .iter()
            .find(|p| p.ctype.mimetype.starts_with("text/plain"))
            .unwrap_or(mail);
        part.get_body_raw()
            .map_err(|e| CollectorError::BadInput(format!("cannot decode mail body: {}", e)))
    }
}

/// One-shot collector over a single raw email.
pub struct EmailCollector<X: EmailExtractor> {
    spec: CollectorSpec,
    raw_email: Vec<u8>,
    extractor: X,
}

impl<X: EmailExtractor> EmailCollector<X> {
    pub fn new(spec: CollectorSpec, raw_email: Vec<u8>, extractor: X) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            raw_email,
            extractor,
        })
    }

    /// Read the raw message from standard input.
    pub fn from_stdin(spec: CollectorSpec, extractor: X) -> Result<Self> {
        let mut raw_email = Vec::new();
        std::io::stdin().read_to_end(&mut raw_email)?;
        Self::new(spec, raw_email, extractor)
    }

    pub async fn run(self, publisher: RawPublisher) -> Result<()> {
        let mail = mailparse::parse_mail(&self.raw_email)
            .map_err(|e| CollectorError::BadInput(format!("unparseable email: {}", e)))?;

        let body = self.extractor.extract_body(&mail)?;
        let meta = email_meta(&mail);
        let components = self.spec.output_components(body, meta);
        publisher.publish(components).await?;
        publisher.flush().await?;
        Ok(())
    }
}

/// `mail_time` (UTC) and `mail_subject` headers of the message.
fn email_meta(mail: &ParsedMail<'_>) -> BTreeMap<String, serde_json::Value> {
    let mut meta = BTreeMap::new();
    if let Some(date_header) = mail.headers.get_first_value("Date") {
        if let Ok(epoch) = mailparse::dateparse(&date_header) {
            if let Some(datetime) = DateTime::from_timestamp(epoch, 0) {
                meta.insert(
                    "mail_time".to_string(),
                    serde_json::json!(datetime.format("%Y-%m-%d %H:%M:%S").to_string()),
                );
            }
        }
    }
    if let Some(subject) = mail.headers.get_first_value("Subject") {
        meta.insert("mail_subject".to_string(), serde_json::json!(subject));
    }
    meta
}
