//! Text-plus-metadata wire format for message bodies.
//!
//! The transport only carries a plain `content` string, so structured
//! payloads ride along after a marker:
//!
//! ```text
//! content ::= [text] ATTACHMENT_MARKER json_array
//!           | [text] SHARE_MARKER json_object
//!           | text
//! ```

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::DecodeError;
use crate::rooms::{Attachment, SharedItem};

pub const ATTACHMENT_MARKER: &str = "\n[[attachments]]";
pub const SHARE_MARKER: &str = "\n[[shared]]";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedContent {
    pub text: String,
    pub attachments: Option<Vec<Attachment>>,
    pub shared_item: Option<SharedItem>,
}

pub fn encode(text: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return text.to_string();
    }
    // Serializing plain structs of strings and integers cannot fail
    let json = serde_json::to_string(attachments).unwrap_or_else(|_| "[]".to_string());
    format!("{}{}{}", text, ATTACHMENT_MARKER, json)
}

pub fn encode_shared(text: &str, item: &SharedItem) -> String {
    let json = serde_json::to_string(item).unwrap_or_else(|_| "{}".to_string());
    format!("{}{}{}", text, SHARE_MARKER, json)
}

/// Split a raw content string back into text and payload. Never fails:
/// a malformed payload degrades to text only.
pub fn decode(raw: &str) -> DecodedContent {
    if let Some((prefix, suffix)) = split_marker(raw, ATTACHMENT_MARKER) {
        return DecodedContent {
            text: prefix.trim().to_string(),
            attachments: parse_payload::<Vec<Attachment>>(suffix, "attachment").ok(),
            shared_item: None,
        };
    }

    if let Some((prefix, suffix)) = split_marker(raw, SHARE_MARKER) {
        return DecodedContent {
            text: prefix.trim().to_string(),
            attachments: None,
            shared_item: parse_payload::<SharedItem>(suffix, "shared item").ok(),
        };
    }

    DecodedContent {
        text: raw.to_string(),
        ..Default::default()
    }
}

/// Everything after the first marker belongs to the payload, line breaks included
fn split_marker<'a>(raw: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    raw.find(marker)
        .map(|idx| (&raw[..idx], &raw[idx + marker.len()..]))
}

fn parse_payload<T: DeserializeOwned>(suffix: &str, what: &'static str) -> Result<T, DecodeError> {
    serde_json::from_str(suffix.trim()).map_err(|source| {
        let err = DecodeError { what, source };
        debug!(error = %err, "Dropping undecodable message payload");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::AttachmentKind;

    fn image(name: &str) -> Attachment {
        Attachment {
            url: format!("https://cdn.test/{}", name),
            kind: AttachmentKind::Image,
            name: name.to_string(),
            size: Some(2048),
            mime_type: Some("image/png".to_string()),
        }
    }

    fn share() -> SharedItem {
        SharedItem {
            item_type: "notebook".into(),
            item_id: "nb-7".into(),
            item_title: "Biology".into(),
            permission_level: "view".into(),
        }
    }

    #[test]
    fn encode_without_attachments_is_identity() {
        assert_eq!(encode("plain text", &[]), "plain text");
        assert_eq!(decode("plain text"), DecodedContent {
            text: "plain text".into(),
            ..Default::default()
        });
    }

    #[test]
    fn attachments_survive_a_round_trip() {
        let attachments = vec![image("a.png"), image("b.png")];
        for text in ["", "hello", "  padded  ", "multi\nline\ntext"] {
            let decoded = decode(&encode(text, &attachments));
            assert_eq!(decoded.text, text.trim());
            assert_eq!(decoded.attachments.as_deref(), Some(attachments.as_slice()));
            assert!(decoded.shared_item.is_none());
        }
    }

    #[test]
    fn payload_may_contain_line_breaks() {
        let raw = format!(
            "see below{}[\n  {{\"url\": \"https://cdn.test/x\",\n \"type\": \"file\", \"name\": \"x\"}}\n]",
            ATTACHMENT_MARKER
        );
        let decoded = decode(&raw);
        assert_eq!(decoded.text, "see below");
        assert_eq!(decoded.attachments.unwrap()[0].kind, AttachmentKind::File);
    }

    #[test]
    fn malformed_payload_degrades_to_text() {
        let decoded = decode(&format!("hi there {}[{{not json", ATTACHMENT_MARKER));
        assert_eq!(decoded.text, "hi there");
        assert!(decoded.attachments.is_none());

        let decoded = decode(ATTACHMENT_MARKER);
        assert_eq!(decoded.text, "");
        assert!(decoded.attachments.is_none());

        // An object where an array belongs is also malformed
        let decoded = decode(&format!("x{}{{\"url\": 1}}", ATTACHMENT_MARKER));
        assert!(decoded.attachments.is_none());
    }

    #[test]
    fn decode_is_total_on_odd_input() {
        for raw in ["", "\n", "[[attachments]]", "\n[[shared]]", "\u{0}\u{ffff}", "🙂\n[[shared]]🙂"] {
            let _ = decode(raw);
        }
    }

    #[test]
    fn shared_item_round_trip() {
        let decoded = decode(&encode_shared("check this", &share()));
        assert_eq!(decoded.text, "check this");
        assert_eq!(decoded.shared_item, Some(share()));
        assert!(decoded.attachments.is_none());
    }

    #[test]
    fn shared_item_uses_camel_case_keys() {
        let raw = encode_shared("", &share());
        assert!(raw.contains("\"itemType\":\"notebook\""));
        assert!(raw.contains("\"permissionLevel\":\"view\""));
    }

    #[test]
    fn malformed_shared_item_degrades() {
        let decoded = decode(&format!("look{}{{\"itemType\": 3", SHARE_MARKER));
        assert_eq!(decoded.text, "look");
        assert!(decoded.shared_item.is_none());
    }

    #[test]
    fn attachment_marker_wins_over_share_marker() {
        let raw = format!("{}{}", encode("t", &[image("a.png")]), SHARE_MARKER);
        let decoded = decode(&raw);
        // The share marker lands inside the array suffix, so the payload is malformed
        assert!(decoded.attachments.is_none());
        assert!(decoded.shared_item.is_none());
        assert_eq!(decoded.text, "t");
    }
}
