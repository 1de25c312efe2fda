//! Tagged-document codec for the interoperability query entry point.
//!
//! Remote handlers running on a differently-typed runtime expect their
//! response-type envelope as a nested tag document rather than a flat
//! key/value blob. The codec renders a JSON object tree into that document:
//! each object key becomes a tag, scalar values become text content.

use bytes::Bytes;
use serde_json::Value;

use crate::{Codec, CodecError};

/// Codec rendering a nested tag/attribute document.
///
/// Only encoding is supported; the bus never sends tagged documents back.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedDocumentCodec;

impl Codec for TaggedDocumentCodec {
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        match value {
            Value::Object(_) => {
                let mut out = String::new();
                render(value, &mut out)?;
                Ok(Bytes::from(out))
            }
            _ => Err(CodecError::Encode(
                "tagged documents require an object at the root".to_string(),
            )),
        }
    }

    fn decode(&self, _data: &[u8]) -> Result<Value, CodecError> {
        Err(CodecError::Unsupported("tagged-document decode"))
    }
}

fn render(value: &Value, out: &mut String) -> Result<(), CodecError> {
    match value {
        Value::Object(map) => {
            for (tag, child) in map {
                out.push('<');
                out.push_str(tag);
                out.push('>');
                render(child, out)?;
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
            Ok(())
        }
        Value::String(text) => {
            escape_into(text, out);
            Ok(())
        }
        Value::Number(n) => {
            out.push_str(&n.to_string());
            Ok(())
        }
        Value::Bool(b) => {
            out.push_str(if *b { "true" } else { "false" });
            Ok(())
        }
        Value::Null => Ok(()),
        Value::Array(_) => Err(CodecError::Encode(
            "tagged documents do not support arrays".to_string(),
        )),
    }
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_nested_tags() {
        let codec = TaggedDocumentCodec;
        let doc = json!({
            "wrapper": { "expectedResponseType": "com.example.Greeting" }
        });

        let encoded = codec.encode(&doc).unwrap();
        assert_eq!(
            encoded,
            "<wrapper><expectedResponseType>com.example.Greeting</expectedResponseType></wrapper>"
        );
    }

    #[test]
    fn escapes_text_content() {
        let codec = TaggedDocumentCodec;
        let doc = json!({ "tag": "a < b & c" });

        let encoded = codec.encode(&doc).unwrap();
        assert_eq!(encoded, "<tag>a &lt; b &amp; c</tag>");
    }

    #[test]
    fn rejects_non_object_root() {
        let codec = TaggedDocumentCodec;
        assert!(codec.encode(&json!("scalar")).is_err());
    }

    #[test]
    fn decode_is_unsupported() {
        let codec = TaggedDocumentCodec;
        assert!(codec.decode(b"<tag/>").is_err());
    }
}
