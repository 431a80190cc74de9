//! Chat envelope and the two text forms it travels in.
//!
//! Older clients send `name: body` lines, newer ones send a JSON object with
//! `username` and `message` fields. Decoding tries JSON first and degrades to
//! the line form, so a peer never sees a decode error.

use serde::Deserialize;

use crate::{config::WireFormat, error::DecodeError};

/// Sender used when a payload carries no recognizable name.
pub const SYSTEM_SENDER: &str = "System";

/// Body prefix marking a prompt addressed to the room's assistant.
pub const ANNOTATION_MARKER: &str = "[LLM]";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tag {
    #[default]
    Plain,
    Annotated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub body: String,
    pub tag: Tag,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, body: impl Into<String>, tag: Tag) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            tag,
        }
    }

    pub fn is_annotated(&self) -> bool {
        self.tag == Tag::Annotated
    }

    /// Body as it appears on the wire, with the marker restored.
    pub fn tagged_body(&self) -> String {
        apply_tag(&self.body, self.tag)
    }

    pub fn encode(&self, format: WireFormat) -> String {
        match format {
            WireFormat::Structured => encode_structured(self),
            WireFormat::Delimited => encode(&self.sender, &self.body, self.tag),
        }
    }
}

/// Accepts the field names of every client generation seen in the wild.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(alias = "myUserName")]
    username: String,
    #[serde(alias = "myMessage")]
    message: String,
}

/// Renders the `sender: body` line form.
pub fn encode(sender: &str, body: &str, tag: Tag) -> String {
    format!("{sender}: {}", apply_tag(body, tag))
}

/// Renders the JSON form. The tag rides inside `message` as the marker.
pub fn encode_structured(envelope: &Envelope) -> String {
    serde_json::json!({
        "username": envelope.sender,
        "message": envelope.tagged_body(),
    })
    .to_string()
}

pub fn decode(raw: &str) -> Envelope {
    decode_structured(raw)
        .or_else(|_| decode_delimited(raw))
        .unwrap_or_else(|_| {
            let (body, tag) = split_tag(raw);
            Envelope::new(SYSTEM_SENDER, body, tag)
        })
}

pub fn decode_structured(raw: &str) -> Result<Envelope, DecodeError> {
    let wire: WireEnvelope = serde_json::from_str(raw)?;
    let sender = wire.username.trim();
    if sender.is_empty() {
        return Err(DecodeError::EmptySender);
    }
    let (body, tag) = split_tag(wire.message.trim());
    Ok(Envelope::new(sender, body, tag))
}

fn decode_delimited(raw: &str) -> Result<Envelope, DecodeError> {
    let Some((sender, body)) = raw.split_once(':') else {
        return Err(DecodeError::MissingDelimiter);
    };
    let sender = sender.trim();
    if sender.is_empty() {
        return Err(DecodeError::EmptySender);
    }
    let (body, tag) = split_tag(body.trim());
    Ok(Envelope::new(sender, body, tag))
}

fn split_tag(body: &str) -> (String, Tag) {
    match body.trim_start().strip_prefix(ANNOTATION_MARKER) {
        Some(rest) => (rest.trim_start().to_string(), Tag::Annotated),
        None => (body.to_string(), Tag::Plain),
    }
}

fn apply_tag(body: &str, tag: Tag) -> String {
    match tag {
        Tag::Plain => body.to_string(),
        Tag::Annotated => format!("{ANNOTATION_MARKER} {body}"),
    }
}
