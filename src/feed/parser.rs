use chrono::Utc;
use quick_xml::events::{BytesText, Event};
use quick_xml::Reader;
use std::borrow::Cow;
use thiserror::Error;

use super::extract::build_item;
use super::types::{format_fallback_timestamp, MissingDate, ParseOptions, ParseResult};

/// The document could not be read as markup at all.
///
/// Individual items that fail extraction never produce this error; they are
/// dropped instead.
#[derive(Debug, Error)]
pub enum FeedParseError {
    #[error("XML parse error at byte {position}: {message}")]
    Xml { position: u64, message: String },
}

/// Which text sink the parser is currently filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    ItemTitle,
    ItemDescription,
    FeedTitle,
    FeedDate,
}

#[derive(Debug, Default)]
struct ItemBuffer {
    title: String,
    description: String,
    /// Element stack depth at which `<item>` was opened
    depth: usize,
}

#[derive(Debug, Default)]
struct ParserState {
    /// Lower-cased local names of the currently open elements
    stack: Vec<String>,
    saw_root: bool,
    field: Option<(Field, usize)>,
    item: Option<ItemBuffer>,
    feed_title: Option<String>,
    feed_date: Option<String>,
    result: ParseResult,
    dropped: usize,
}

impl ParserState {
    fn open(&mut self, local_name: &[u8]) {
        let name = String::from_utf8_lossy(local_name).to_ascii_lowercase();
        self.stack.push(name);
        self.saw_root = true;
        let depth = self.stack.len();

        // Markup nested inside a title/description keeps feeding that field
        if self.field.is_some() {
            return;
        }

        let name = self.stack[depth - 1].as_str();
        if name == "item" && self.item.is_none() {
            self.item = Some(ItemBuffer {
                depth,
                ..ItemBuffer::default()
            });
            return;
        }

        let field = if self.item.is_some() {
            match name {
                "title" => Some(Field::ItemTitle),
                "description" => Some(Field::ItemDescription),
                _ => None,
            }
        } else if self.at_channel_level() {
            match name {
                "title" if self.feed_title.is_none() => {
                    self.feed_title = Some(String::new());
                    Some(Field::FeedTitle)
                }
                "pubdate" | "lastbuilddate" if self.feed_date.is_none() => {
                    self.feed_date = Some(String::new());
                    Some(Field::FeedDate)
                }
                _ => None,
            }
        } else {
            None
        };

        self.field = field.map(|f| (f, depth));
    }

    /// True when the innermost open element is a direct child of `<channel>`
    /// or of the document root.
    fn at_channel_level(&self) -> bool {
        let depth = self.stack.len();
        depth == 2 || (depth >= 2 && self.stack[depth - 2] == "channel")
    }

    fn close(&mut self) {
        self.stack.pop();
        let depth = self.stack.len();

        if matches!(self.field, Some((_, field_depth)) if depth < field_depth) {
            self.field = None;
        }

        if matches!(&self.item, Some(item) if depth < item.depth) {
            if let Some(item) = self.item.take() {
                match build_item(&item.title, &item.description) {
                    Some(rate) => self.result.items.push(rate),
                    None => {
                        self.dropped += 1;
                        tracing::trace!(title = %item.title, "Dropping unparsable rate item");
                    }
                }
            }
        }
    }

    fn push_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Some((field, _)) = self.field else {
            return;
        };

        let sink = match field {
            Field::ItemTitle => self.item.as_mut().map(|i| &mut i.title),
            Field::ItemDescription => self.item.as_mut().map(|i| &mut i.description),
            Field::FeedTitle => self.feed_title.as_mut(),
            Field::FeedDate => self.feed_date.as_mut(),
        };
        if let Some(sink) = sink {
            append_fragment(sink, text);
        }
    }
}

/// Feeds may split one element's text into several chunks; join them with a
/// single space.
fn append_fragment(base: &mut String, add: &str) {
    if !base.is_empty() {
        base.push(' ');
    }
    base.push_str(add);
}

/// Resolves the XML builtins plus `&nbsp;`, which rate feeds routinely emit.
fn resolve_entity(entity: &str) -> Option<&'static str> {
    match entity {
        "lt" => Some("<"),
        "gt" => Some(">"),
        "amp" => Some("&"),
        "apos" => Some("'"),
        "quot" => Some("\""),
        "nbsp" => Some("\u{a0}"),
        _ => None,
    }
}

fn decode_text<'a>(text: &'a BytesText<'a>) -> Cow<'a, str> {
    match text.unescape_with(resolve_entity) {
        Ok(unescaped) => unescaped,
        Err(e) => {
            // Unknown entity: keep the raw text rather than failing the document
            tracing::debug!(error = %e, "Keeping undecodable text fragment verbatim");
            String::from_utf8_lossy(text)
        }
    }
}

/// Parses a rate feed with the default options.
///
/// See [`parse_with`].
pub fn parse(text: &str) -> Result<ParseResult, FeedParseError> {
    parse_with(text, &ParseOptions::default())
}

/// Parses a rate feed document into a [`ParseResult`].
///
/// Blank input is an empty, successful result. Items whose code or rate cannot
/// be recovered are silently dropped. Only markup that cannot be read at all
/// (mismatched or unclosed tags, no root element) is an error.
///
/// The caller is expected to hand over text that starts at the document's
/// opening tag and ends at the closing root tag.
pub fn parse_with(text: &str, options: &ParseOptions) -> Result<ParseResult, FeedParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(ParseResult::default());
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut state = ParserState::default();
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| FeedParseError::Xml {
                position: reader.buffer_position() as u64,
                message: e.to_string(),
            })?;

        match event {
            Event::Start(e) => state.open(e.local_name().as_ref()),
            Event::Empty(e) => {
                state.open(e.local_name().as_ref());
                state.close();
            }
            Event::End(_) => state.close(),
            Event::Text(e) => {
                let text = decode_text(&e);
                state.push_text(&text);
            }
            Event::CData(e) => {
                let text = String::from_utf8_lossy(&e).into_owned();
                state.push_text(&text);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = state.stack.last() {
        return Err(FeedParseError::Xml {
            position: reader.buffer_position() as u64,
            message: format!("unexpected end of document inside <{}>", open),
        });
    }
    if !state.saw_root {
        return Err(FeedParseError::Xml {
            position: 0,
            message: "document has no root element".to_string(),
        });
    }

    let mut result = state.result;
    result.title = state.feed_title.unwrap_or_default().trim().to_string();
    result.last_updated = match state.feed_date {
        Some(date) => date.trim().to_string(),
        None => match options.missing_date {
            MissingDate::Now => format_fallback_timestamp(Utc::now()),
            MissingDate::Blank => String::new(),
        },
    };

    tracing::debug!(
        items = result.items.len(),
        dropped = state.dropped,
        "Parsed rate feed"
    );
    Ok(result)
}
