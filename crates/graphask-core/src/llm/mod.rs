//! Language-model plumbing for query drafting
//!
//! This module provides:
//! - Chat message and prompt types handed to a drafter
//! - Cypher extraction from model responses
//!
//! The network client itself lives outside this crate, behind
//! [`crate::providers::QueryDrafter`].

mod extraction;
mod types;

pub use extraction::{CodeBlock, extract_code_blocks, extract_cypher};
pub use types::{DraftOptions, Message, MessageRole, Prompt};
