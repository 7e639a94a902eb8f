//! Generation prompt rendering

use handlebars::{Handlebars, RenderError};
use serde::Serialize;
use tracing::debug;

use crate::domain::RetryAction;

use super::reference::ReferenceSelection;

/// Template variables for one attempt
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub character: String,
    pub animation: String,
    pub frame_index: usize,
    /// One-based, for human-facing prompts
    pub frame_number: usize,
    pub total_frames: usize,
    pub reference: String,
    pub reference_source: String,
    /// Ladder rung guidance; absent on first attempts
    pub hint: Option<String>,
}

impl PromptContext {
    pub fn new(
        character: &str,
        animation: &str,
        frame_index: usize,
        total_frames: usize,
        reference: &ReferenceSelection,
        action: Option<RetryAction>,
    ) -> Self {
        Self {
            character: character.to_string(),
            animation: animation.to_string(),
            frame_index,
            frame_number: frame_index + 1,
            total_frames,
            reference: reference.reference.clone(),
            reference_source: reference.source.to_string(),
            hint: action.map(|a| a.prompt_hint().to_string()),
        }
    }
}

/// Handlebars renderer for the configured prompt template
pub struct PromptRenderer {
    hbs: Handlebars<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    /// Renderer without HTML escaping; prompts are plain text
    pub fn new() -> Self {
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        Self { hbs }
    }

    pub fn render(&self, template: &str, context: &PromptContext) -> Result<String, RenderError> {
        debug!(frame = context.frame_index, hint = ?context.hint, "PromptRenderer::render: called");
        self.hbs.render_template(template, context)
    }
}
