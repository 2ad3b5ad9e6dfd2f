//! Streaming output
//!
//! Generated fragments are pushed into a [`TokenSink`] as soon as the engine
//! produces them. A sink reports when its consumer has gone away, which is
//! how a caller cancels a generation.

use std::sync::mpsc;

/// Token sent through a channel-backed stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    Token(String),
    Done,
    Error(String),
}

/// Receives generated text as it is produced
pub trait TokenSink: Send {
    /// Deliver one fragment; `false` means nobody is listening any more
    fn push(&mut self, fragment: &str) -> bool;

    /// Called once after the last fragment with the outcome
    fn finish(&mut self, _error: Option<&str>) {}
}

impl TokenSink for tokio::sync::mpsc::UnboundedSender<String> {
    fn push(&mut self, fragment: &str) -> bool {
        self.send(fragment.to_string()).is_ok()
    }
}

/// Bounded channels apply backpressure to the generating thread
impl TokenSink for tokio::sync::mpsc::Sender<String> {
    fn push(&mut self, fragment: &str) -> bool {
        self.blocking_send(fragment.to_string()).is_ok()
    }
}

impl TokenSink for mpsc::Sender<StreamToken> {
    fn push(&mut self, fragment: &str) -> bool {
        self.send(StreamToken::Token(fragment.to_string())).is_ok()
    }

    fn finish(&mut self, error: Option<&str>) {
        let token = match error {
            Some(e) => StreamToken::Error(e.to_string()),
            None => StreamToken::Done,
        };
        let _ = self.send(token);
    }
}

/// Sink backed by a closure
pub struct FnSink<F>(pub F);

impl<F> TokenSink for FnSink<F>
where
    F: FnMut(&str) -> bool + Send,
{
    fn push(&mut self, fragment: &str) -> bool {
        (self.0)(fragment)
    }
}

/// Sink that discards everything; the full text is still returned by the caller
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TokenSink for NullSink {
    fn push(&mut self, _fragment: &str) -> bool {
        true
    }
}

/// Turns per-token byte pieces back into text
///
/// A multi-byte character may be split across tokens. Its leading bytes are
/// held until the rest arrive, so no fragment ever ends mid-character.
pub struct PieceDecoder {
    decoder: encoding_rs::Decoder,
}

impl PieceDecoder {
    pub fn new() -> Self {
        Self {
            decoder: encoding_rs::UTF_8.new_decoder_without_bom_handling(),
        }
    }

    /// Text completed by these bytes
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.decode(bytes, false)
    }

    /// Whatever is still held back; a dangling partial character becomes U+FFFD
    pub fn finish(&mut self) -> String {
        self.decode(&[], true)
    }

    fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 4);
        let mut text = String::with_capacity(capacity);
        let _ = self.decoder.decode_to_string(bytes, &mut text, last);
        text
    }
}

impl Default for PieceDecoder {
    fn default() -> Self {
        Self::new()
    }
}
