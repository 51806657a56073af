use serde_json::{json, Value};

/// Accumulates the chunks of one assistant response until end of turn.
///
/// A response made only of text assembles into a single string. Once a
/// structured block shows up, the content becomes an array of blocks, with
/// surrounding text kept as `{"type": "text", "text": ...}` blocks in order.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    text: String,
    blocks: Vec<Value>,
    chunks: usize,
}

impl TurnBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text chunk to the current text run.
    pub fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
        self.chunks += 1;
    }

    /// Closes the current text run and appends a structured block.
    pub fn push_block(&mut self, block: Value) {
        self.flush_text();
        self.blocks.push(block);
        self.chunks += 1;
    }

    /// Number of chunks received so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Whether nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    /// Drops everything buffered. Returns the number of chunks discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.chunks;
        *self = Self::default();
        dropped
    }

    /// The assembled turn content.
    pub fn into_content(mut self) -> Value {
        if self.blocks.is_empty() {
            return Value::String(self.text);
        }
        self.flush_text();
        Value::Array(self.blocks)
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            self.blocks.push(json!({ "type": "text", "text": text }));
        }
    }
}
