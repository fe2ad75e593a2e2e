//! Structural parser over the JSON token stream.
//!
//! Folds tokens through a stack of tagged frames. Direct children of
//! the top-level `results` array are cut out and emitted as standalone
//! row fragments the moment they complete; the top-level `errors`
//! array is buffered and signalled once, whole; everything else
//! accumulates into a residual document that ends up as the single
//! remaining frame, with `results` rewritten to an empty array and
//! `errors` preserved verbatim.

use super::{StreamParseError, encode_string};
use crate::stream::tokenizer::JsonToken;

/// Signal produced by [`StreamParser::accept`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEmit {
    /// One element of the `results` array, serialized as standalone
    /// JSON text.
    Row(String),
    /// The top-level `errors` array closed; each element is the
    /// serialization of one entry.
    ErrorsComplete(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Template {
    Object,
    Array,
}

#[derive(Debug)]
struct ContextFrame {
    template: Template,
    /// Serialized children: `"key":value` strings for objects, value
    /// strings for arrays.
    items: Vec<String>,
    is_results: bool,
    is_errors: bool,
    is_row: bool,
}

impl ContextFrame {
    fn plain(template: Template) -> Self {
        Self {
            template,
            items: Vec::new(),
            is_results: false,
            is_errors: false,
            is_row: false,
        }
    }

    fn serialize(&self) -> String {
        match self.template {
            Template::Object => format!("{{{}}}", self.items.join(",")),
            Template::Array => format!("[{}]", self.items.join(",")),
        }
    }
}

#[derive(Debug)]
enum Frame {
    Context(ContextFrame),
    /// A pending object key waiting for its value.
    Key(String),
    /// The serialized top-level value once it completes.
    Primitive(String),
}

pub struct StreamParser {
    stack: Vec<Frame>,
    in_results: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            in_results: false,
        }
    }

    /// Fold one token. At most one signal can result: a completed row,
    /// or the completed errors array.
    pub fn accept(&mut self, token: JsonToken) -> Result<Option<ParseEmit>, StreamParseError> {
        match token {
            JsonToken::StartObject => {
                let is_row = self.top_is_results_array();
                let mut frame = ContextFrame::plain(Template::Object);
                frame.is_row = is_row;
                self.stack.push(Frame::Context(frame));
                Ok(None)
            }
            JsonToken::StartArray => {
                let mut frame = ContextFrame::plain(Template::Array);
                match self.top_level_key() {
                    Some("results") => {
                        frame.is_results = true;
                        self.in_results = true;
                    }
                    Some("errors") => frame.is_errors = true,
                    _ => {
                        // Any direct child of `results` is a row, even
                        // when the row itself is an array.
                        frame.is_row = self.top_is_results_array();
                    }
                }
                self.stack.push(Frame::Context(frame));
                Ok(None)
            }
            JsonToken::Key(key) => {
                self.stack.push(Frame::Key(key));
                Ok(None)
            }
            JsonToken::EndObject => self.close_context(Template::Object),
            JsonToken::EndArray => self.close_context(Template::Array),
            JsonToken::String(s) => self.place_scalar(encode_string(&s)),
            JsonToken::Number(lexeme) => self.place_scalar(lexeme),
            JsonToken::True => self.place_scalar("true".to_string()),
            JsonToken::False => self.place_scalar("false".to_string()),
            JsonToken::Null => self.place_scalar("null".to_string()),
        }
    }

    /// Consume the parser after end-of-stream, yielding the residual
    /// document.
    pub fn finish(mut self) -> Result<String, StreamParseError> {
        if self.stack.len() != 1 {
            return Err(StreamParseError::new(
                "response body ended with unclosed values",
                0,
            ));
        }
        match self.stack.pop() {
            Some(Frame::Primitive(text)) => Ok(text),
            _ => Err(StreamParseError::new(
                "response body ended with unclosed values",
                0,
            )),
        }
    }

    fn close_context(&mut self, template: Template) -> Result<Option<ParseEmit>, StreamParseError> {
        let frame = match self.stack.pop() {
            Some(Frame::Context(frame)) if frame.template == template => frame,
            _ => {
                return Err(StreamParseError::new(
                    "close token without a matching open context",
                    0,
                ));
            }
        };

        if frame.is_row && self.in_results {
            // Rows bypass the residual entirely.
            return Ok(Some(ParseEmit::Row(frame.serialize())));
        }
        if frame.is_results {
            // Rows were siphoned off; the residual keeps an empty array
            // under the key.
            self.in_results = false;
            self.append_value("[]".to_string())?;
            return Ok(None);
        }
        if frame.is_errors {
            let entries = frame.items.clone();
            self.append_value(frame.serialize())?;
            return Ok(Some(ParseEmit::ErrorsComplete(entries)));
        }
        let text = frame.serialize();
        self.append_value(text)?;
        Ok(None)
    }

    fn place_scalar(&mut self, serialized: String) -> Result<Option<ParseEmit>, StreamParseError> {
        if self.top_is_results_array() {
            return Ok(Some(ParseEmit::Row(serialized)));
        }
        self.append_value(serialized)?;
        Ok(None)
    }

    /// Attach a completed value to its parent: pair it with a pending
    /// key, push it as an array element, or let it stand as the
    /// top-level document.
    fn append_value(&mut self, serialized: String) -> Result<(), StreamParseError> {
        if matches!(self.stack.last(), Some(Frame::Key(_))) {
            let Some(Frame::Key(key)) = self.stack.pop() else {
                unreachable!("just checked the top frame is a key");
            };
            return match self.stack.last_mut() {
                Some(Frame::Context(parent)) if parent.template == Template::Object => {
                    parent.items.push(format!("{}:{serialized}", encode_string(&key)));
                    Ok(())
                }
                _ => Err(StreamParseError::new(
                    "key frame without an enclosing object",
                    0,
                )),
            };
        }
        match self.stack.last_mut() {
            Some(Frame::Context(parent)) => {
                parent.items.push(serialized);
                Ok(())
            }
            None => {
                self.stack.push(Frame::Primitive(serialized));
                Ok(())
            }
            Some(_) => Err(StreamParseError::new(
                "multiple top-level values in response body",
                0,
            )),
        }
    }

    fn top_is_results_array(&self) -> bool {
        matches!(
            self.stack.last(),
            Some(Frame::Context(frame)) if frame.is_results
        )
    }

    /// The pending key, but only at top-level-object depth: the stack
    /// is exactly `[document object, key]`. `results`/`errors` nested
    /// inside rows or other values get no special treatment.
    fn top_level_key(&self) -> Option<&str> {
        if self.stack.len() != 2 {
            return None;
        }
        match (&self.stack[0], &self.stack[1]) {
            (Frame::Context(root), Frame::Key(key))
                if root.template == Template::Object && !root.is_row =>
            {
                Some(key.as_str())
            }
            _ => None,
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}
