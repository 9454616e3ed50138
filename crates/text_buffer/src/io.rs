use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

use thiserror::Error;
use tracing::debug;

use piece_tree::LineEnding;

use crate::buffer::TextBuffer;
use crate::TextBufferBuilder;

/// Errors surfaced while loading a buffer from disk.
#[derive(Error, Debug)]
pub enum TextBufferError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Load a file in 64 KiB blocks, carrying partial UTF-8 sequences across
/// block boundaries, and build a buffer with `\n` as the fallback EOL.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<TextBuffer, TextBufferError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut builder = TextBufferBuilder::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut carry: Vec<u8> = Vec::new();
    let mut total = 0usize;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n;

        let mut combined = Vec::with_capacity(carry.len() + n);
        combined.extend_from_slice(&carry);
        combined.extend_from_slice(&buf[..n]);

        // longest valid UTF-8 prefix; the rest may be a split codepoint
        let valid_len = match std::str::from_utf8(&combined) {
            Ok(_) => combined.len(),
            Err(e) => e.valid_up_to(),
        };

        if valid_len > 0 {
            let s = std::str::from_utf8(&combined[..valid_len]).expect("valid UTF-8 prefix");
            builder.accept_chunk(s);
        }

        carry.clear();
        if valid_len < combined.len() {
            carry.extend_from_slice(&combined[valid_len..]);
        }
    }

    if !carry.is_empty() {
        match std::str::from_utf8(&carry) {
            Ok(s) => builder.accept_chunk(s),
            Err(_) => {
                // trailing broken sequence: decode lossily
                let s = String::from_utf8_lossy(&carry);
                builder.accept_chunk(&s);
            }
        }
    }

    debug!(bytes = total, "loaded buffer from disk");
    Ok(builder.finish(LineEnding::Lf, false))
}
