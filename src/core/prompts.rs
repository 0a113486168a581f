//! Prompt builders for the reasoning loop.
//!
//! Every JSON-mode prompt states the exact object shape it expects back;
//! the reasoner tolerates missing keys.

use std::fmt::Write as _;

use crate::adapters::{Prompt, PromptKind};
use crate::domain::{Evidence, Modality};

/// Longest excerpt quoted into a prompt, in characters
const EXCERPT_CHARS: usize = 600;

/// Numbered evidence listing shared by several prompts
pub fn render_evidence(evidence: &[Evidence]) -> String {
    if evidence.is_empty() {
        return "(no evidence retrieved)".to_string();
    }

    let mut out = String::new();
    for (i, item) in evidence.iter().enumerate() {
        let modality = match item.modality {
            Modality::Document => "document",
            Modality::Video => "video",
        };
        let locator = item.locator.map(|l| format!(" @ {}", l.label())).unwrap_or_default();
        let excerpt: String = item.text_excerpt.chars().take(EXCERPT_CHARS).collect();
        let _ = writeln!(
            out,
            "[{}] ({} {}{}) {}",
            i + 1,
            modality,
            item.source_asset_id,
            locator,
            excerpt.trim()
        );
    }
    out
}

pub fn query_refiner(question: &str, context: &str, is_retry: bool) -> Prompt {
    let retry_note = if is_retry {
        "The previous search did not return sufficient evidence. Broaden or rephrase the keywords.\n"
    } else {
        ""
    };

    Prompt::new(
        PromptKind::QueryRefiner,
        format!(
            "You turn a student's question about their course material into search parameters.\n\
             {retry_note}\
             Recent conversation:\n{context}\n\n\
             Question: {question}\n\n\
             Reply with a JSON object only:\n\
             {{\"search_params\": {{\"keywords\": [string], \"top_k\": integer}},\n \
             \"preferences\": {{\"asset_name\": string|null, \"modality\": \"pdf\"|\"video\"|null,\n \
             \"target_page\": integer|null, \"timestamp\": number|null}}}}"
        ),
    )
}

pub fn intent_check(question: &str, evidence: &[Evidence], any_video: bool) -> Prompt {
    Prompt::new(
        PromptKind::IntentCheck,
        format!(
            "Decide which specialist tools are needed to answer the question.\n\
             Question: {question}\n\
             Video evidence available: {any_video}\n\
             Evidence:\n{}\n\
             Reply with a JSON object only:\n\
             {{\"need_vision\": bool, \"need_sandbox\": bool,\n \
             \"vision_strategy\": string|null, \"reasoning_focus\": string}}",
            render_evidence(evidence)
        ),
    )
}

pub fn evidence_evaluator(question: &str, evidence: &[Evidence]) -> Prompt {
    Prompt::new(
        PromptKind::EvidenceEvaluator,
        format!(
            "You audit retrieved evidence before an answer is written.\n\
             Question: {question}\n\
             Evidence:\n{}\n\
             If the evidence cannot support an answer, choose \"refetch\"; otherwise \"proceed\".\n\
             Request visual analysis if the answer depends on what a video frame shows, and\n\
             symbolic verification if it depends on a formula or calculation.\n\
             Reply with a JSON object only:\n\
             {{\"action\": \"proceed\"|\"refetch\", \"reason\": string,\n \
             \"trigger_tools\": {{\"call_reasoning_eye\": bool, \"call_sandbox\": bool}}}}",
            render_evidence(evidence)
        ),
    )
}

pub fn sandbox_prep(evidence: &[Evidence]) -> Prompt {
    let context = evidence
        .iter()
        .map(|e| e.text_excerpt.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    Prompt::new(
        PromptKind::SandboxPrep,
        format!(
            "Extract the single most important formula from the text below as a SymPy expression.\n\
             Text: {context}\n\n\
             Reply with a JSON object only:\n\
             {{\"expression\": string, \"target_variable\": string, \"substitutions\": object}}\n\
             Use \"empty\" as the expression if the text contains no formula worth verifying."
        ),
    )
}

/// Inputs to the final answer
#[derive(Debug, Default)]
pub struct SynthesisInput<'a> {
    pub question: &'a str,
    pub history: &'a str,
    pub evidence: &'a [Evidence],
    pub vision_feedback: Option<&'a str>,
    pub verification: Option<&'a str>,
    pub audit_reason: Option<&'a str>,
}

pub fn synthesizer(input: &SynthesisInput<'_>) -> Prompt {
    let mut text = format!(
        "You are an academic tutor. Answer the question using only the evidence below and\n\
         cite sources with their bracketed numbers.\n\n\
         Conversation so far:\n{}\n\n\
         Question: {}\n\n\
         Evidence:\n{}",
        input.history,
        input.question,
        render_evidence(input.evidence)
    );

    if let Some(vision) = input.vision_feedback {
        let _ = write!(text, "\nVisual analysis: {}", vision);
    }
    if let Some(verification) = input.verification {
        let _ = write!(text, "\nSymbolic verification: {}", verification);
    }
    if let Some(reason) = input.audit_reason {
        let _ = write!(text, "\nEvidence audit: {}", reason);
    }

    Prompt::new(PromptKind::Synthesizer, text)
}
