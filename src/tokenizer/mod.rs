//! Byte-level tokenizer for the demo workload.

/// Maps each UTF-8 byte to its own id (vocab size 256).
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const VOCAB_SIZE: usize = 256;

    pub fn new() -> Self {
        Self
    }

    /// Encode text to token IDs.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.bytes().map(usize::from).collect()
    }

    /// Decode token IDs to text. Ids outside the vocabulary are skipped and
    /// invalid UTF-8 is replaced.
    pub fn decode(&self, ids: &[usize]) -> String {
        let bytes: Vec<u8> = ids.iter().filter_map(|&id| u8::try_from(id).ok()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Display text of a single token: printable ASCII as-is, anything else as `<0xNN>`.
    pub fn token_text(&self, id: usize) -> String {
        match u8::try_from(id) {
            Ok(b) if b.is_ascii_graphic() || b == b' ' => char::from(b).to_string(),
            Ok(b) => format!("<0x{b:02X}>"),
            Err(_) => format!("<unk:{id}>"),
        }
    }
}
