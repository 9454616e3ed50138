use piece_tree::{create_line_starts, replace_line_endings, LineEnding, StringBuffer};

use crate::buffer::TextBuffer;

/// Incremental constructor for a [`TextBuffer`]. Chunks may arrive in
/// arbitrary slices; a `\r\n` pair split across two chunks is re-united
/// before line starts are computed, and terminator counts are kept so
/// [`finish`](Self::finish) can pick the dominant line ending.
#[derive(Default, Debug)]
pub struct TextBufferBuilder {
    chunks: Vec<StringBuffer>,
    has_previous_cr: bool,
    cr: usize,
    lf: usize,
    crlf: usize,
}

impl TextBufferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a chunk of text (may include multiple lines). A trailing `\r`
    /// is held back until the next chunk arrives.
    pub fn accept_chunk(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }

        if self.has_previous_cr {
            self.has_previous_cr = false;
            let mut combined = String::with_capacity(chunk.len() + 1);
            combined.push('\r');
            combined.push_str(chunk);
            self.push_chunk(combined);
        } else {
            self.push_chunk(chunk.to_string());
        }
    }

    fn push_chunk(&mut self, mut chunk: String) {
        if chunk.ends_with('\r') {
            self.has_previous_cr = true;
            chunk.pop();
            if chunk.is_empty() {
                return;
            }
        }

        let scanned = create_line_starts(&chunk);
        self.cr += scanned.cr;
        self.lf += scanned.lf;
        self.crlf += scanned.crlf;
        self.chunks
            .push(StringBuffer::with_line_starts(chunk, scanned.line_starts));
    }

    /// Finish building. The EOL is the majority terminator (ties and
    /// no-terminator input fall back to `default_eol`); with `normalize_eol`
    /// every chunk is rewritten to that EOL first.
    pub fn finish(mut self, default_eol: LineEnding, normalize_eol: bool) -> TextBuffer {
        if self.has_previous_cr {
            // flush the held-back \r as a final chunk
            self.has_previous_cr = false;
            let scanned = create_line_starts("\r");
            self.cr += scanned.cr;
            self.chunks.push(StringBuffer::with_line_starts(
                "\r".to_string(),
                scanned.line_starts,
            ));
        }

        let eol = self.pick_eol(default_eol);
        let needs_rewrite = match eol {
            LineEnding::Crlf => self.cr > 0 || self.lf > 0,
            LineEnding::Lf => self.cr > 0 || self.crlf > 0,
        };

        let chunks = if normalize_eol && needs_rewrite {
            self.chunks
                .into_iter()
                .map(|chunk| StringBuffer::new(replace_line_endings(chunk.as_str(), eol.as_str())))
                .collect()
        } else {
            self.chunks
        };

        let eol_normalized = !needs_rewrite || normalize_eol;
        TextBuffer::from_chunks(chunks, eol, eol_normalized)
    }

    fn pick_eol(&self, default_eol: LineEnding) -> LineEnding {
        let total = self.cr + self.lf + self.crlf;
        let total_cr = self.cr + self.crlf;
        if total == 0 {
            return default_eol;
        }
        if total_cr > total / 2 {
            LineEnding::Crlf
        } else {
            LineEnding::Lf
        }
    }
}
