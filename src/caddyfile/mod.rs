/// Lossless block-level Caddyfile model
pub mod document;

/// Fixed blocks and input validation
pub mod templates;

pub use document::{Block, BlockKind, CaddyDocument, ParseError};
