//! The wrapper sent as the HTTP body, and its encodings.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WebhookResult;
use crate::subscription::ContentType;

/// Event metadata and payload as delivered to a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Public id of the subscription the delivery belongs to.
    pub subscription_public_id: String,
    /// Event type, e.g. `order.created`.
    pub event_type: String,
    /// When the envelope was built.
    pub timestamp: DateTime<Utc>,
    /// Owning tenant.
    pub tenant_id: String,
    /// Event payload.
    pub data: Value,
    /// Optional event metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Envelope {
    /// Serializes the envelope for the given content type.
    pub fn encode(&self, content_type: ContentType) -> WebhookResult<Vec<u8>> {
        match content_type {
            ContentType::Json | ContentType::PlainText => Ok(serde_json::to_vec(self)?),
            ContentType::Xml => Ok(to_xml(&self.to_value()?).into_bytes()),
            ContentType::FormUrlEncoded => Ok(to_form(&self.to_value()?).into_bytes()),
        }
    }

    fn to_value(&self) -> WebhookResult<Value> {
        let mut value = serde_json::to_value(self)?;
        // Text encodings carry second precision.
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        Ok(value)
    }
}

fn to_xml(value: &Value) -> String {
    let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    write_element(&mut out, "webhook", value);
    out
}

fn write_element(out: &mut String, name: &str, value: &Value) {
    let name = xml_name(name);
    match value {
        Value::Null => {
            out.push('<');
            out.push_str(&name);
            out.push_str("/>");
        }
        Value::Object(map) => {
            open(out, &name);
            for (key, child) in map {
                write_element(out, key, child);
            }
            close(out, &name);
        }
        Value::Array(items) => {
            open(out, &name);
            for item in items {
                write_element(out, "item", item);
            }
            close(out, &name);
        }
        Value::String(s) => {
            open(out, &name);
            escape_into(out, s);
            close(out, &name);
        }
        Value::Bool(_) | Value::Number(_) => {
            open(out, &name);
            out.push_str(&value.to_string());
            close(out, &name);
        }
    }
}

fn open(out: &mut String, name: &str) {
    out.push('<');
    out.push_str(name);
    out.push('>');
}

fn close(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

/// Coerces a JSON key into a legal XML element name.
fn xml_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok {
        name.insert(0, '_');
    }
    name
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

/// Top-level fields become form pairs; nested structures are sent as JSON.
fn to_form(value: &Value) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(map) = value.as_object() {
        for (key, field) in map {
            let encoded = match field {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            serializer.append_pair(key, &encoded);
        }
    }
    serializer.finish()
}
