//! Compiled source registry, used to resolve spans back to text when
//! rendering error messages.

use std::collections::HashMap;

/// The sources participating in one compilation: the pipeline file, plus any
/// synthetic sources such as CLI-provided variable values.
#[derive(Debug, Clone, Default)]
pub struct SourceFiles {
    /// name → content
    pub sources: HashMap<String, String>,
    /// id (as carried by spans) → name
    pub source_ids: HashMap<u16, String>,
}

/// The span source id of the pipeline file itself.
pub const PIPELINE_SOURCE_ID: u16 = 0;

impl SourceFiles {
    pub fn single(name: &str, content: &str) -> Self {
        let mut files = SourceFiles::default();
        files.insert(PIPELINE_SOURCE_ID, name, content);
        files
    }

    pub fn insert(&mut self, id: u16, name: &str, content: &str) {
        self.sources.insert(name.to_string(), content.to_string());
        self.source_ids.insert(id, name.to_string());
    }

    pub fn name_of(&self, id: u16) -> Option<&String> {
        self.source_ids.get(&id)
    }

    pub fn content_of(&self, id: u16) -> Option<&String> {
        self.name_of(id).and_then(|name| self.sources.get(name))
    }
}
