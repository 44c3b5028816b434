//! Fixed instruction sets for every model call site.
//!
//! Each constant is a complete system prompt; request-specific material
//! (claims, evidence blocks, drafts) is appended by the caller. Structured
//! call sites describe their output schema in the prompt and rely on JSON
//! output mode plus local decoding.

use chrono::{DateTime, Utc};

/// General-conversation instructions, templated with today's date.
pub fn agent_instructions(now: DateTime<Utc>) -> String {
    format!(
        "You are a helpful assistant that can answer questions and help with tasks.\n\
         Today's date is {}.",
        now.format("%Y-%m-%d")
    )
}

/// Intent router. Output schema: `{"route": "..."}`.
pub const ROUTER_PROMPT: &str = "\
You classify the user's latest message into exactly one intent.

Intents:
- \"general_chat\": ordinary conversation, questions, or help requests.
- \"fact_check_input\": the user provides text and wants to know whether it \
is true, accurate, or supported by their documents.
- \"generate_content\": the user asks you to write, draft, or produce \
content (copy, posts, summaries, descriptions) on their behalf.

Respond with a JSON object: {\"route\": \"<intent>\"}. Use only the three \
intent names above.";

/// Claim extraction. Output schema: `{"claims": ["..."]}`.
pub const EXTRACT_CLAIMS_PROMPT: &str = "\
Decompose the user's text into atomic, self-contained, checkable factual \
statements.

Rules:
- Each claim must stand alone: resolve pronouns and keep every qualifier \
(population, comparator, dosage, timeframe, units) inside the claim.
- Exclude opinions, questions, instructions, and hedged speculation.
- Do not merge distinct facts into one claim or split one fact into several.
- If the text contains no checkable factual statements, return an empty list.

Respond with a JSON object: {\"claims\": [\"...\"]}.";

/// Claim adjudication. Output schema:
/// `{"is_supported": bool, "document_name": string|null,
///   "matching_text": string|null, "source_id": string|null}`.
pub const ADJUDICATE_PROMPT: &str = "\
You decide whether a claim is supported by the provided context.

The context is a list of evidence blocks, each tagged with a source_id and \
a document name. A claim is supported only if some block states it or \
directly entails it; related-but-different statements do not count.

If the claim is supported:
- set is_supported to true,
- set source_id to the single best-matching block's source_id (copied \
exactly from the context),
- set document_name to that block's document name,
- set matching_text to a verbatim excerpt of at most 25 words from that \
block.

If the claim is not supported by any block, set is_supported to false and \
set document_name, matching_text, and source_id to null.

Respond with a JSON object: {\"is_supported\": ..., \"document_name\": ..., \
\"matching_text\": ..., \"source_id\": ...}.";

/// Fact-check summary over a complete, ordered verdict set.
pub const SUMMARY_PROMPT: &str = "\
You report the results of checking the user's text against their documents.

You are given the original text and a verdict for each extracted claim, in \
order. Write a short, readable report that:
- addresses each claim in the order given,
- states plainly whether it is supported, citing the document name when \
one is given,
- states explicitly when a claim is not supported by the documents,
- never invents sources or verdicts beyond those provided.";

/// Content drafting for the generate route.
pub const DRAFT_PROMPT: &str = "\
You draft the content the user asked for, grounded in the conversation.

Write the content itself with no preamble or commentary. Make factual \
statements only when you believe the user's documents support them.";

/// Rewrite of a draft whose claims failed verification.
pub const REWRITE_PROMPT: &str = "\
A draft you produced contains statements that are not supported by the \
user's documents. You are given the draft and the list of unsupported \
claims.

Rewrite the draft so that every unsupported statement is corrected or \
removed. Keep the tone, structure, and supported content intact. Output \
only the rewritten draft.";

/// Presentation of an approved draft together with its verified sourcing.
pub const APPROVED_DRAFT_PROMPT: &str = "\
Every factual claim in the draft below was verified against the user's \
documents. Present the draft to the user: include the draft itself and a \
brief note that its claims are supported by the cited documents. Do not \
alter the draft's content.";

/// Thread title derivation from the first user message.
pub const TITLE_PROMPT: &str =
    "Write a 3-5 word Title Case chat title from the user's first message. No quotes.";
