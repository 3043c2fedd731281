//! Splitting the XMPP byte stream into top-level frames.
//!
//! Over TCP a session is a single XML document: `<stream:stream>` opens it,
//! every stanza is one child element, and `</stream:stream>` ends it. The
//! socket hands out arbitrary chunks, so `StreamFramer` buffers them and
//! yields one complete frame at a time.

use quick_xml::Reader;
use quick_xml::errors::{Error as XmlError, SyntaxError};
use quick_xml::events::Event;

use crate::utils::error::SourceError;

/// A partial frame larger than this means the peer is not speaking XMPP.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The `<stream:stream ...>` header, verbatim.
    StreamOpen(String),
    /// One complete top-level element, verbatim.
    Element(String),
    /// `</stream:stream>`
    StreamClose,
}

#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: Vec<u8>,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drops whatever is buffered. Used when the stream restarts after SASL.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        // Whitespace between stanzas is a keepalive.
        let blank = self
            .buffer
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buffer.drain(..blank);

        match extract_frame(&self.buffer)? {
            Some((frame, consumed)) => {
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            None if self.buffer.len() > MAX_FRAME_BYTES => Err(SourceError::Xml(format!(
                "incomplete frame exceeds {MAX_FRAME_BYTES} bytes"
            ))),
            None => Ok(None),
        }
    }
}

/// Finds the first complete frame in `buffer` and the number of bytes it
/// spans (including anything skipped before it).
fn extract_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>, SourceError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth = 0usize;
    let mut start = 0usize;
    loop {
        let before = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(XmlError::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype,
            )) => return Ok(None),
            Err(e) => return Err(SourceError::Xml(e.to_string())),
        };
        let end = reader.buffer_position() as usize;

        match event {
            Event::Start(tag) if depth == 0 && tag.local_name().as_ref() == b"stream" => {
                return Ok(Some((Frame::StreamOpen(text(&buffer[before..end])), end)));
            }
            Event::Start(_) => {
                if depth == 0 {
                    start = before;
                }
                depth += 1;
            }
            Event::Empty(_) if depth == 0 => {
                return Ok(Some((Frame::Element(text(&buffer[before..end])), end)));
            }
            Event::End(tag) if depth == 0 => {
                if tag.local_name().as_ref() == b"stream" {
                    return Ok(Some((Frame::StreamClose, end)));
                }
                return Err(SourceError::Xml(format!(
                    "unbalanced closing tag at byte {before}"
                )));
            }
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some((Frame::Element(text(&buffer[start..end])), end)));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
