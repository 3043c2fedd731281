//! XML framing of the JSON payload.
//!
//! The relay exchanges JSON wrapped in a `<gcm>` element inside an XMPP
//! `<message>`:
//!
//! ```xml
//! <message><gcm xmlns="google:mobile:data">{"to":"..."}</gcm></message>
//! ```

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::{NsReader, Reader};

use crate::utils::error::SourceError;

pub const FCM_ELEMENT: &str = "gcm";
pub const FCM_NAMESPACE: &str = "google:mobile:data";

/// One top-level XML element exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    xml: String,
}

impl Stanza {
    /// Wraps a JSON payload into a `<message>` stanza, escaping it as XML text.
    pub fn wrap_json(json: &str) -> Self {
        Self {
            xml: format!(
                "<message><{FCM_ELEMENT} xmlns=\"{FCM_NAMESPACE}\">{}</{FCM_ELEMENT}></message>",
                escape(json)
            ),
        }
    }

    /// Takes a raw stanza as received from the wire.
    pub fn from_xml(xml: impl Into<String>) -> Self {
        Self { xml: xml.into() }
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// Finds the `gcm` element in the `google:mobile:data` namespace and
    /// returns its unescaped text.
    pub fn extract_json(&self) -> Result<String, SourceError> {
        let mut reader = NsReader::from_str(&self.xml);
        let mut payload: Option<String> = None;

        loop {
            match reader.read_resolved_event() {
                Ok((ResolveResult::Bound(ns), Event::Start(start)))
                    if ns.as_ref() == FCM_NAMESPACE.as_bytes()
                        && start.local_name().as_ref() == FCM_ELEMENT.as_bytes() =>
                {
                    payload = Some(String::new());
                }
                Ok((ResolveResult::Bound(ns), Event::Empty(start)))
                    if ns.as_ref() == FCM_NAMESPACE.as_bytes()
                        && start.local_name().as_ref() == FCM_ELEMENT.as_bytes() =>
                {
                    return Err(SourceError::MissingPayload);
                }
                Ok((_, Event::Text(text))) => {
                    if let Some(buf) = payload.as_mut() {
                        let text = text.unescape().map_err(|e| SourceError::Xml(e.to_string()))?;
                        buf.push_str(&text);
                    }
                }
                Ok((_, Event::CData(data))) => {
                    if let Some(buf) = payload.as_mut() {
                        let text = std::str::from_utf8(&data)
                            .map_err(|e| SourceError::Xml(e.to_string()))?;
                        buf.push_str(text);
                    }
                }
                Ok((_, Event::End(end))) if end.local_name().as_ref() == FCM_ELEMENT.as_bytes() => {
                    if let Some(json) = payload.take() {
                        return Ok(json);
                    }
                }
                Ok((_, Event::Eof)) => return Err(SourceError::MissingPayload),
                Ok(_) => {}
                Err(e) => return Err(SourceError::Xml(e.to_string())),
            }
        }
    }
}

/// Name and `type` attribute of the first element in a frame.
pub(crate) fn frame_head(frame: &str) -> Result<(String, Option<String>), SourceError> {
    let mut reader = Reader::from_str(frame);
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                let kind = match start.try_get_attribute("type") {
                    Ok(Some(attr)) => Some(
                        attr.unescape_value()
                            .map_err(|e| SourceError::Xml(e.to_string()))?
                            .into_owned(),
                    ),
                    Ok(None) => None,
                    Err(e) => return Err(SourceError::Xml(e.to_string())),
                };
                return Ok((name, kind));
            }
            Ok(Event::Eof) => return Err(SourceError::Xml("empty frame".to_string())),
            Ok(_) => {}
            Err(e) => return Err(SourceError::Xml(e.to_string())),
        }
    }
}
