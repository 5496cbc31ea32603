use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use sha2::{Digest, Sha256};

use super::types::InboundEmail;
use crate::constants::{DEFAULT_SUBJECT, EMPTY_BODY, MAX_DESCRIPTION_CHARS, TRUNCATION_MARKER};

/// Header lines that leak into bodies of forwarded or badly encoded mail.
const HEADER_PREFIXES: &[&str] = &[
    "From:",
    "To:",
    "Subject:",
    "Date:",
    "Message-ID:",
    "Content-Type:",
    "Content-Transfer-Encoding:",
    "MIME-Version:",
    "X-",
    "Received:",
    "Return-Path:",
    "Delivered-To:",
];

/// Parse a raw RFC 5322 message into the fields a ticket needs.
///
/// Returns `None` when the message has no usable sender address.
pub fn parse_inbound(uid: u32, raw: &[u8]) -> Option<InboundEmail> {
    let message = MessageParser::default().parse(raw)?;

    let from = message.from()?.first()?;
    let from_addr = from.address()?.trim().to_string();
    if from_addr.is_empty() {
        return None;
    }
    let from_name = from
        .name()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| local_part(&from_addr).to_string());

    let subject = message
        .subject()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());

    let (message_id, synthetic_id) = match message.message_id() {
        Some(id) if !id.trim().is_empty() => (id.trim().to_string(), false),
        _ => (synthetic_message_id(raw), true),
    };

    let received_at = message
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let body = extract_text_body(&message)
        .or_else(|| extract_html_body(&message).map(|html| html_to_text(&html)))
        .map(|text| clean_body(&text))
        .unwrap_or_else(|| EMPTY_BODY.to_string());

    Some(InboundEmail {
        uid,
        message_id,
        synthetic_id,
        subject,
        from_addr,
        from_name,
        body,
        received_at,
    })
}

fn extract_text_body(message: &mail_parser::Message) -> Option<String> {
    for part in message.text_bodies() {
        if let PartType::Text(text) = &part.body {
            return Some(text.to_string());
        }
    }

    // Fallback: any plain text part
    for part in message.parts.iter() {
        if let PartType::Text(text) = &part.body {
            let content_type = part.content_type();
            if content_type
                .map(|ct| ct.subtype() == Some("plain"))
                .unwrap_or(true)
            {
                return Some(text.to_string());
            }
        }
    }

    None
}

fn extract_html_body(message: &mail_parser::Message) -> Option<String> {
    for part in message.html_bodies() {
        if let PartType::Html(html) = &part.body {
            return Some(html.to_string());
        }
    }

    None
}

/// Convert HTML to readable plain text
pub fn html_to_text(html: &str) -> String {
    html2text::config::plain()
        .string_from_read(html.as_bytes(), 100)
        .unwrap_or_else(|e| {
            tracing::debug!("HTML conversion failed: {}", e);
            String::new()
        })
}

/// Strip stray header lines, collapse blank-line runs and cap the length.
pub fn clean_body(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.lines() {
        if HEADER_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        }
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        cleaned.push_str(line.trim_end());
        cleaned.push('\n');
    }

    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return EMPTY_BODY.to_string();
    }

    if cleaned.chars().count() > MAX_DESCRIPTION_CHARS {
        let mut truncated: String = cleaned.chars().take(MAX_DESCRIPTION_CHARS).collect();
        truncated.push_str(TRUNCATION_MARKER);
        truncated
    } else {
        cleaned.to_string()
    }
}

/// Stable identifier for mail that arrived without a Message-ID.
pub fn synthetic_message_id(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("{}@helpdesk-sync.local", hex)
}

pub fn local_part(address: &str) -> &str {
    address.split('@').next().unwrap_or(address)
}
