//! Messaging gateway webhook format
//!
//! The gateway posts form fields (`From`, `Body`, `NumMedia`, `MediaUrl0`,
//! ...) and expects a TwiML-style XML document back.

use std::collections::HashMap;

/// Inbound gateway message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayMessage {
    pub from: String,
    pub body: String,
    pub media_urls: Vec<String>,
}

impl GatewayMessage {
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self, String> {
        let from = form
            .get("From")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing From".to_string())?
            .to_string();
        let body = form.get("Body").cloned().unwrap_or_default();

        let num_media: usize = form
            .get("NumMedia")
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0);
        let media_urls = (0..num_media)
            .filter_map(|i| {
                let url = form.get(&format!("MediaUrl{i}"))?;
                let content_type = form
                    .get(&format!("MediaContentType{i}"))
                    .map_or("unknown", String::as_str);
                tracing::debug!(index = i, content_type, "Gateway media attachment");
                Some(url.clone())
            })
            .collect();

        Ok(Self {
            from,
            body,
            media_urls,
        })
    }
}

/// Wrap a reply in the gateway's response document
pub fn twiml_reply(text: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
        escape_xml(text)
    )
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_parses_media_up_to_num_media() {
        let msg = GatewayMessage::from_form(&form(&[
            ("From", "whatsapp:+15550001"),
            ("Body", "here you go"),
            ("NumMedia", "1"),
            ("MediaUrl0", "https://media.example/0.jpg"),
            ("MediaContentType0", "image/jpeg"),
            ("MediaUrl1", "https://media.example/ignored.jpg"),
        ]))
        .unwrap();

        assert_eq!(msg.from, "whatsapp:+15550001");
        assert_eq!(msg.body, "here you go");
        assert_eq!(msg.media_urls, ["https://media.example/0.jpg"]);
    }

    #[test]
    fn test_missing_from_is_rejected() {
        assert!(GatewayMessage::from_form(&form(&[("Body", "hi")])).is_err());
        assert!(GatewayMessage::from_form(&form(&[("From", "  ")])).is_err());
    }

    #[test]
    fn test_reply_is_escaped() {
        assert_eq!(
            twiml_reply("Tues & Wed <10am>"),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>Tues &amp; Wed &lt;10am&gt;</Message></Response>"
        );
    }
}
