use std::io::Cursor;

use plist::{Dictionary, Value};
use thiserror::Error;

pub const XML_CONTENT_TYPE: &str = "text/x-apple-plist+xml";
pub const BINARY_CONTENT_TYPE: &str = "application/x-apple-binary-plist";

const BINARY_MAGIC: &[u8] = b"bplist00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentForm {
    Xml,
    Binary,
}

impl DocumentForm {
    pub fn content_type(self) -> &'static str {
        match self {
            DocumentForm::Xml => XML_CONTENT_TYPE,
            DocumentForm::Binary => BINARY_CONTENT_TYPE,
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("plist encode failed: {0}")]
    Encode(#[source] plist::Error),
    #[error("plist decode failed: {0}")]
    Decode(#[source] plist::Error),
    #[error("unexpected document shape: {0}")]
    UnexpectedShape(String),
}

pub fn encode(document: &Value, form: DocumentForm) -> Result<Vec<u8>, DocumentError> {
    let mut buf = Vec::new();
    let written = match form {
        DocumentForm::Xml => document.to_writer_xml(&mut buf),
        DocumentForm::Binary => document.to_writer_binary(&mut buf),
    };
    written.map_err(DocumentError::Encode)?;
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<(Value, DocumentForm), DocumentError> {
    let form = if bytes.starts_with(BINARY_MAGIC) {
        DocumentForm::Binary
    } else {
        DocumentForm::Xml
    };
    let value = Value::from_reader(Cursor::new(bytes)).map_err(DocumentError::Decode)?;
    Ok((value, form))
}

/// Display settings sent with the slideshow subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideshowSettings {
    pub slide_duration: u64,
    pub theme: String,
}

impl Default for SlideshowSettings {
    fn default() -> Self {
        Self {
            slide_duration: 3,
            theme: "Origami".to_string(),
        }
    }
}

/// `{state: "playing", settings: {slideDuration, theme}}`
pub fn subscribe_document(settings: &SlideshowSettings) -> Value {
    let mut inner = Dictionary::new();
    inner.insert(
        "slideDuration".to_string(),
        Value::Integer(settings.slide_duration.into()),
    );
    inner.insert("theme".to_string(), Value::String(settings.theme.clone()));

    let mut root = Dictionary::new();
    root.insert("state".to_string(), Value::String("playing".to_string()));
    root.insert("settings".to_string(), Value::Dictionary(inner));
    Value::Dictionary(root)
}

/// `{data: <image>, info: {key: 1, id: 1}}`
pub fn asset_document(image: &[u8]) -> Value {
    let mut info = Dictionary::new();
    info.insert("key".to_string(), Value::Integer(1u64.into()));
    info.insert("id".to_string(), Value::Integer(1u64.into()));

    let mut root = Dictionary::new();
    root.insert("data".to_string(), Value::Data(image.to_vec()));
    root.insert("info".to_string(), Value::Dictionary(info));
    Value::Dictionary(root)
}

/// Image bytes and the `info` pair carried by an asset document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPayload {
    pub data: Vec<u8>,
    pub key: u64,
    pub id: u64,
}

pub fn parse_asset_document(document: &Value) -> Result<AssetPayload, DocumentError> {
    let root = document
        .as_dictionary()
        .ok_or_else(|| DocumentError::UnexpectedShape("root is not a dictionary".into()))?;
    let data = root
        .get("data")
        .and_then(Value::as_data)
        .ok_or_else(|| DocumentError::UnexpectedShape("missing data".into()))?;
    let info = root
        .get("info")
        .and_then(Value::as_dictionary)
        .ok_or_else(|| DocumentError::UnexpectedShape("missing info".into()))?;
    let field = |name: &str| {
        info.get(name)
            .and_then(Value::as_unsigned_integer)
            .ok_or_else(|| DocumentError::UnexpectedShape(format!("missing info.{name}")))
    };

    Ok(AssetPayload {
        data: data.to_vec(),
        key: field("key")?,
        id: field("id")?,
    })
}
