//! Note records as seen by the semantic engine.
//!
//! The engine only needs an id, a title and content. Notes arrive from the
//! application's persistence layer as JSON; unknown fields are ignored.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Identity of a note in the application's database.
pub type NoteId = u64;

/// Anything that can be embedded and ranked as a note.
pub trait NoteRecord {
    fn id(&self) -> NoteId;
    fn title(&self) -> &str;
    fn content(&self) -> &str;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

impl Note {
    pub fn new(id: NoteId, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            content: content.into(),
        }
    }
}

impl NoteRecord for Note {
    fn id(&self) -> NoteId {
        self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn content(&self) -> &str {
        &self.content
    }
}

/// Parse a JSON array of notes, rejecting duplicate ids.
pub fn parse_notes(json: &str) -> anyhow::Result<Vec<Note>> {
    let notes: Vec<Note> = serde_json::from_str(json).context("notes must be a JSON array")?;

    let mut seen = std::collections::HashSet::with_capacity(notes.len());
    for note in &notes {
        if !seen.insert(note.id) {
            anyhow::bail!("duplicate note id {}", note.id);
        }
    }

    Ok(notes)
}

/// Read notes exported by the application.
pub fn load_notes(path: &Path) -> anyhow::Result<Vec<Note>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read notes from {}", path.display()))?;
    parse_notes(&json).with_context(|| format!("malformed notes file {}", path.display()))
}
