//! Chat transcript rendering
//!
//! Engines that take a flat prompt rebuild it from the conversation state on
//! every generation. The layout follows the bundle's `conv_template`.

use crate::types::{ConversationTurn, Role};

/// Prompt layout for a conversation template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateStyle {
    /// `[INST] <<SYS>> ... <</SYS>> ... [/INST]`
    Llama2,
    /// `USER: ...` / `ASSISTANT: ...` lines
    Plain,
}

impl TemplateStyle {
    pub fn from_conv_template(name: Option<&str>) -> Self {
        match name {
            Some(name) if name.starts_with("llama-2") || name.starts_with("llama2") => {
                TemplateStyle::Llama2
            }
            _ => TemplateStyle::Plain,
        }
    }
}

/// System prompt plus the turns applied so far
#[derive(Debug, Clone)]
pub struct Transcript {
    style: TemplateStyle,
    system: Option<String>,
    turns: Vec<ConversationTurn>,
}

impl Transcript {
    pub fn new(style: TemplateStyle) -> Self {
        Self {
            style,
            system: None,
            turns: Vec::new(),
        }
    }

    pub fn reset(&mut self, system: Option<&str>) {
        self.system = system.map(str::to_string);
        self.turns.clear();
    }

    pub fn push(&mut self, turn: &ConversationTurn) {
        self.turns.push(turn.clone());
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Full prompt text with `prompt` as the pending user message
    pub fn render_with_prompt(&self, prompt: &str) -> String {
        let pending = ConversationTurn::user(prompt);
        let turns = self.turns.iter().chain(std::iter::once(&pending));
        match self.style {
            TemplateStyle::Llama2 => self.render_llama2(turns),
            TemplateStyle::Plain => self.render_plain(turns),
        }
    }

    fn render_llama2<'a>(&self, turns: impl Iterator<Item = &'a ConversationTurn>) -> String {
        let mut out = String::new();
        let mut system = self.system.as_deref();
        let mut first = true;

        for turn in turns {
            match turn.role {
                Role::User => {
                    if !first {
                        out.push_str("<s>");
                    }
                    out.push_str("[INST] ");
                    if let Some(sys) = system.take() {
                        out.push_str("<<SYS>>\n");
                        out.push_str(sys);
                        out.push_str("\n<</SYS>>\n\n");
                    }
                    out.push_str(turn.text.trim());
                    out.push_str(" [/INST]");
                }
                Role::Assistant => {
                    out.push(' ');
                    out.push_str(turn.text.trim());
                    out.push_str(" </s>");
                }
                Role::System => {}
            }
            first = false;
        }
        out
    }

    fn render_plain<'a>(&self, turns: impl Iterator<Item = &'a ConversationTurn>) -> String {
        let mut out = String::new();
        if let Some(system) = &self.system {
            out.push_str(system.trim());
            out.push_str("\n\n");
        }
        for turn in turns.filter(|t| t.role != Role::System) {
            out.push_str(turn.role.as_tag());
            out.push_str(": ");
            out.push_str(turn.text.trim());
            out.push('\n');
        }
        out.push_str(Role::Assistant.as_tag());
        out.push(':');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_from_template_name() {
        assert_eq!(TemplateStyle::from_conv_template(Some("llama-2")), TemplateStyle::Llama2);
        assert_eq!(TemplateStyle::from_conv_template(Some("vicuna_v1.1")), TemplateStyle::Plain);
        assert_eq!(TemplateStyle::from_conv_template(None), TemplateStyle::Plain);
    }

    #[test]
    fn test_llama2_layout() {
        let mut transcript = Transcript::new(TemplateStyle::Llama2);
        transcript.reset(Some("Be brief."));
        transcript.push(&ConversationTurn::user("Hi"));
        transcript.push(&ConversationTurn::assistant("Hello!"));

        assert_eq!(
            transcript.render_with_prompt("Name a colour"),
            "[INST] <<SYS>>\nBe brief.\n<</SYS>>\n\nHi [/INST] Hello! </s><s>[INST] Name a colour [/INST]"
        );
    }

    #[test]
    fn test_plain_layout() {
        let mut transcript = Transcript::new(TemplateStyle::Plain);
        transcript.push(&ConversationTurn::user("2+2?"));
        transcript.push(&ConversationTurn::assistant("4"));
        assert_eq!(
            transcript.render_with_prompt("3+3?"),
            "USER: 2+2?\nASSISTANT: 4\nUSER: 3+3?\nASSISTANT:"
        );
    }

    #[test]
    fn test_reset_clears_turns() {
        let mut transcript = Transcript::new(TemplateStyle::Plain);
        transcript.push(&ConversationTurn::user("x"));
        transcript.reset(None);
        assert!(transcript.is_empty());
    }
}
