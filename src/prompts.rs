// Prompt assembly: role system prompts are opaque strings loaded once;
// user prompts are built from debate state by pure functions.

use std::path::Path;

use crate::llm_client::ChatMessage;
use crate::templates::TemplateRef;
use crate::trace_store::Round;

const DEFAULT_PROPOSER: &str = "You are the Proposer in a structured debate. Construct the strongest, \
most complete answer you can to the user's question. Use any reasoning \
templates you are given as scaffolding, state your assumptions, and show \
your reasoning. When responding to criticism, address every point \
directly instead of restating your previous answer.";

const DEFAULT_SKEPTIC: &str = "You are the Skeptic in a structured debate. Attack the Proposer's answer: \
find errors, gaps, unstated assumptions, and weak reasoning. Be specific \
and cite the exact claim you dispute. Mark any flaw that must be fixed \
before the answer can stand with the exact phrase SEVERITY: CRITICAL. If \
every remaining concern is minor, end your critique with the exact line \
READY_TO_CONCLUDE.";

const DEFAULT_SYNTHESIZER: &str = "You are the Synthesizer. You receive a question and the transcript of a \
debate about it. Produce one polished, self-contained answer that keeps \
the Proposer's strongest material and repairs everything the Skeptic \
validly criticized. Do not mention the debate or the participants.";

const DEFAULT_SCORER: &str = "You grade answers. Given a question and an answer, reply with a single \
JSON object of the form {\"score\": <integer 1-10>, \"reasoning\": \"<one \
sentence>\"} and nothing else. 10 means complete, correct, and clear; 1 \
means useless.";

/// Role system prompts, loaded once at startup. Files in the prompt
/// directory override the compiled defaults per role.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub proposer: String,
    pub skeptic: String,
    pub synthesizer: String,
    pub scorer: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            proposer: DEFAULT_PROPOSER.to_string(),
            skeptic: DEFAULT_SKEPTIC.to_string(),
            synthesizer: DEFAULT_SYNTHESIZER.to_string(),
            scorer: DEFAULT_SCORER.to_string(),
        }
    }
}

impl PromptSet {
    pub fn load(dir: Option<&Path>) -> Self {
        let mut set = Self::default();
        let Some(dir) = dir else {
            return set;
        };
        for (file, slot) in [
            ("proposer.txt", &mut set.proposer),
            ("skeptic.txt", &mut set.skeptic),
            ("synthesizer.txt", &mut set.synthesizer),
            ("scorer.txt", &mut set.scorer),
        ] {
            match std::fs::read_to_string(dir.join(file)) {
                Ok(text) if !text.trim().is_empty() => *slot = text.trim().to_string(),
                Ok(_) => {
                    tracing::warn!(file, "prompt file is empty, keeping default");
                }
                Err(_) => {}
            }
        }
        set
    }
}

/// Proposer input. Round 1 sees the retrieved templates; later rounds see
/// the transcript so far and the Skeptic's latest critique.
pub fn proposer_messages(
    set: &PromptSet,
    query: &str,
    templates: &[TemplateRef],
    rounds: &[Round],
) -> Vec<ChatMessage> {
    let user = if rounds.is_empty() {
        let mut text = String::new();
        if !templates.is_empty() {
            text.push_str("Reasoning templates retrieved for this question:\n\n");
            for template in templates {
                text.push_str(&template_block(template));
                text.push('\n');
            }
        }
        text.push_str(&format!("Question:\n{query}\n\nGive your best answer."));
        text
    } else {
        let latest_critique = rounds
            .last()
            .map(|round| round.skeptic_text.as_str())
            .unwrap_or_default();
        format!(
            "Question:\n{query}\n\nDebate so far:\n{digest}\n\nThe Skeptic's latest critique:\n{latest_critique}\n\nRevise your answer. Address each point of the critique explicitly.",
            digest = transcript(rounds),
        )
    };

    vec![
        ChatMessage::system(&set.proposer),
        ChatMessage::user(user),
    ]
}

/// Skeptic input for one round. Wording escalates from full critique to
/// unresolved-items focus to final-round framing.
pub fn skeptic_messages(
    set: &PromptSet,
    query: &str,
    rounds: &[Round],
    proposal: &str,
    round: u32,
    max_rounds: u32,
) -> Vec<ChatMessage> {
    let framing = if round == 1 {
        "Give a full critique of this answer.".to_string()
    } else if round >= max_rounds {
        "This is the final round. Name only the issues that would still block this answer, or accept it.".to_string()
    } else {
        "Focus on the issues that remain unresolved from earlier rounds.".to_string()
    };

    let mut user = format!("Question:\n{query}\n\n");
    if !rounds.is_empty() {
        user.push_str(&format!("Earlier rounds:\n{}\n\n", transcript(rounds)));
    }
    user.push_str(&format!(
        "Round {round} of {max_rounds}. The Proposer's current answer:\n{proposal}\n\n{framing}"
    ));

    vec![ChatMessage::system(&set.skeptic), ChatMessage::user(user)]
}

pub fn synthesizer_messages(set: &PromptSet, query: &str, rounds: &[Round]) -> Vec<ChatMessage> {
    let user = format!(
        "Question:\n{query}\n\nFull debate transcript:\n{}\n\nWrite the final answer.",
        transcript(rounds)
    );
    vec![
        ChatMessage::system(&set.synthesizer),
        ChatMessage::user(user),
    ]
}

pub fn scorer_messages(set: &PromptSet, query: &str, final_answer: &str) -> Vec<ChatMessage> {
    let user = format!("Question:\n{query}\n\nAnswer:\n{final_answer}");
    vec![ChatMessage::system(&set.scorer), ChatMessage::user(user)]
}

fn template_block(template: &TemplateRef) -> String {
    format!(
        "### {name} (relevance {score:.2})\n{description}\n\n{body}\n",
        name = template.name,
        score = template.score,
        description = template.description,
        body = template.body,
    )
}

fn transcript(rounds: &[Round]) -> String {
    let mut text = String::new();
    for round in rounds {
        text.push_str(&format!(
            "--- Round {} ---\nProposer:\n{}\n\nSkeptic:\n{}\n\n",
            round.round, round.proposer_text, round.skeptic_text
        ));
    }
    text.trim_end().to_string()
}
