mod buffer;
mod buffer_builder;
mod io;

pub use crate::buffer::TextBuffer;
pub use crate::buffer_builder::TextBufferBuilder;
pub use crate::io::{load_from_path, TextBufferError};

pub use piece_tree::{LineEnding, Position, Range};
