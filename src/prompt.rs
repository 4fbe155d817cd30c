//! Prompt templates for medical question answering
//!
//! Templates use `{name}` placeholders. Rendering is a single left-to-right
//! pass, so text substituted into one placeholder (retrieved documents often
//! contain braces) is never itself re-scanned for placeholders.

use serde::Serialize;

/// Prompt flavour selected by the backend profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFlavor {
    #[default]
    General,
    /// meditron-70b ships its own COT and RAG prompts
    Meditron,
}

/// Role a template plays in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateRole {
    CotSystem,
    CotPrompt,
    MedragSystem,
    MedragPrompt,
}

impl TemplateRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CotSystem => "cot_system",
            Self::CotPrompt => "cot_prompt",
            Self::MedragSystem => "medrag_system",
            Self::MedragPrompt => "medrag_prompt",
        }
    }
}

/// A renderable prompt template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Raw template text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render with named fields. Unknown placeholders are left untouched.
    pub fn render(&self, fields: &[(&str, &str)]) -> String {
        render_placeholders(&self.source, fields)
    }
}

/// Substitute `{name}` placeholders in one pass.
pub fn render_placeholders(template: &str, fields: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let substituted = after.find('}').and_then(|close| {
            let name = &after[..close];
            fields
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });

        match substituted {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

const GENERAL_COT_SYSTEM: &str = concat!(
    "You are a helpful medical expert, and your task is to answer a multi-choice medical question. ",
    "Please first think step-by-step and then choose the answer from the provided options. ",
    "Organize your output in a json formatted as Dict{\"step_by_step_thinking\": Str(explanation), ",
    "\"answer_choice\": Str{A/B/C/...}}. ",
    "Your responses will be used for research purposes only, so please have a definite answer."
);

const GENERAL_COT: &str = concat!(
    "Here is the question:\n",
    "{question}\n\n",
    "Here are the potential choices:\n",
    "{options}\n\n",
    "Please think step-by-step and generate your output in json:"
);

const GENERAL_MEDRAG_SYSTEM: &str = concat!(
    "You are a helpful medical expert, and your task is to answer a multi-choice medical question ",
    "using the relevant documents. ",
    "Please first think step-by-step and then choose the answer from the provided options. ",
    "Organize your output in a json formatted as Dict{\"step_by_step_thinking\": Str(explanation), ",
    "\"answer_choice\": Str{A/B/C/...}}. ",
    "Your responses will be used for research purposes only, so please have a definite answer."
);

const GENERAL_MEDRAG: &str = concat!(
    "Here are the relevant documents:\n",
    "{context}\n\n",
    "Here is the question:\n",
    "{question}\n\n",
    "Here are the potential choices:\n",
    "{options}\n\n",
    "Please think step-by-step and generate your output in json:"
);

const MEDITRON_COT: &str = concat!(
    "Answer the following multiple-choice medical question. ",
    "Think step by step, then finish with \"Answer: <letter>\".\n\n",
    "Question: {question}\n\n",
    "Options:\n",
    "{options}"
);

const MEDITRON_MEDRAG: &str = concat!(
    "Use the documents below to answer the multiple-choice medical question. ",
    "Think step by step, then finish with \"Answer: <letter>\".\n\n",
    "Documents:\n",
    "{context}\n\n",
    "Question: {question}\n\n",
    "Options:\n",
    "{options}"
);

/// The four templates used by one backend
#[derive(Debug, Clone)]
pub struct PromptTemplateSet {
    pub cot_system: PromptTemplate,
    pub cot_prompt: PromptTemplate,
    pub medrag_system: PromptTemplate,
    pub medrag_prompt: PromptTemplate,
}

impl Default for PromptTemplateSet {
    fn default() -> Self {
        Self::for_flavor(PromptFlavor::General)
    }
}

impl PromptTemplateSet {
    pub fn for_flavor(flavor: PromptFlavor) -> Self {
        let mut set = Self {
            cot_system: PromptTemplate::new(GENERAL_COT_SYSTEM),
            cot_prompt: PromptTemplate::new(GENERAL_COT),
            medrag_system: PromptTemplate::new(GENERAL_MEDRAG_SYSTEM),
            medrag_prompt: PromptTemplate::new(GENERAL_MEDRAG),
        };

        if flavor == PromptFlavor::Meditron {
            set.cot_prompt = PromptTemplate::new(MEDITRON_COT);
            set.medrag_prompt = PromptTemplate::new(MEDITRON_MEDRAG);
        }

        set
    }

    pub fn get(&self, role: TemplateRole) -> &PromptTemplate {
        match role {
            TemplateRole::CotSystem => &self.cot_system,
            TemplateRole::CotPrompt => &self.cot_prompt,
            TemplateRole::MedragSystem => &self.medrag_system,
            TemplateRole::MedragPrompt => &self.medrag_prompt,
        }
    }

    /// Replace one template
    pub fn set(&mut self, role: TemplateRole, template: PromptTemplate) {
        match role {
            TemplateRole::CotSystem => self.cot_system = template,
            TemplateRole::CotPrompt => self.cot_prompt = template,
            TemplateRole::MedragSystem => self.medrag_system = template,
            TemplateRole::MedragPrompt => self.medrag_prompt = template,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fields() {
        let template = PromptTemplate::new("Q: {question}\n{options}");
        let rendered = template.render(&[("question", "What?"), ("options", "A. yes")]);
        assert_eq!(rendered, "Q: What?\nA. yes");
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        let rendered = render_placeholders("{a} and {b}", &[("a", "x")]);
        assert_eq!(rendered, "x and {b}");
    }

    #[test]
    fn test_substituted_text_not_rescanned() {
        let rendered = render_placeholders(
            "{context} / {question}",
            &[("context", "doc mentions {question}"), ("question", "Q")],
        );
        assert_eq!(rendered, "doc mentions {question} / Q");
    }

    #[test]
    fn test_unbalanced_braces() {
        assert_eq!(render_placeholders("a { b", &[("b", "x")]), "a { b");
        assert_eq!(render_placeholders("{", &[]), "{");
        assert_eq!(render_placeholders("}{x}", &[("x", "1")]), "}1");
    }

    #[test]
    fn test_system_prompts_keep_json_braces() {
        let set = PromptTemplateSet::default();
        assert!(set.cot_system.source().contains("Dict{\"step_by_step_thinking\""));
    }

    #[test]
    fn test_general_templates_have_fields() {
        let set = PromptTemplateSet::default();
        let cot = set.get(TemplateRole::CotPrompt).render(&[("question", "Q1"), ("options", "A. x")]);
        assert!(cot.contains("Q1"));
        assert!(cot.contains("A. x"));

        let rag = set
            .get(TemplateRole::MedragPrompt)
            .render(&[("context", "CTX"), ("question", "Q1"), ("options", "A. x")]);
        assert!(rag.contains("CTX"));
        assert!(rag.contains("Q1"));
    }

    #[test]
    fn test_meditron_overrides_prompts_only() {
        let general = PromptTemplateSet::for_flavor(PromptFlavor::General);
        let meditron = PromptTemplateSet::for_flavor(PromptFlavor::Meditron);

        assert_ne!(general.cot_prompt, meditron.cot_prompt);
        assert_ne!(general.medrag_prompt, meditron.medrag_prompt);
        assert_eq!(general.cot_system, meditron.cot_system);
        assert_eq!(general.medrag_system, meditron.medrag_system);
    }

    #[test]
    fn test_set_template() {
        let mut set = PromptTemplateSet::default();
        set.set(TemplateRole::CotPrompt, PromptTemplate::new("custom {question}"));
        assert_eq!(set.get(TemplateRole::CotPrompt).render(&[("question", "q")]), "custom q");
        assert_eq!(TemplateRole::CotPrompt.name(), "cot_prompt");
    }
}
