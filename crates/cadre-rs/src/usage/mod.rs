//! Usage accounting for model calls.
//!
//! Providers usually report token counts; when they do not, counts are
//! estimated from character lengths. Context length is always estimated
//! from the formatted request plus the reply so it stays comparable across
//! providers.

pub mod pricing;

pub use pricing::{ModelPricing, pricing_for_model};

use crate::Message;
use crate::provider::{Completion, CompletionRequest};
use crate::session::CallUsage;

/// Characters per token used for estimates. Most tokenizers average 3-4.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Context window assumed when a provider does not advertise one.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 200_000;

/// Estimate tokens for a character count.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars as f64 / DEFAULT_CHARS_PER_TOKEN).ceil() as u64
}

fn message_chars(message: &Message) -> usize {
    let calls: usize = message
        .calls()
        .iter()
        .map(|c| c.function.name.len() + c.function.arguments.len())
        .sum();
    message.text().len() + calls
}

fn request_chars(request: &CompletionRequest) -> usize {
    let messages: usize = request.messages.iter().map(message_chars).sum();
    let tools: usize = request
        .tools
        .iter()
        .map(|t| {
            t.function.name.len()
                + t.function.description.len()
                + t.function.parameters.to_string().len()
        })
        .sum();
    messages + tools
}

fn completion_chars(completion: &Completion) -> usize {
    let calls: usize = completion
        .tool_calls
        .iter()
        .map(|c| c.function.name.len() + c.function.arguments.len())
        .sum();
    completion.content.as_deref().map_or(0, str::len) + calls
}

/// Compute the usage record for one model call.
pub fn measure_call(
    model_id: &str,
    context_limit: Option<u64>,
    request: &CompletionRequest,
    completion: &Completion,
) -> CallUsage {
    let request_tokens = estimate_tokens(request_chars(request));
    let reply_tokens = estimate_tokens(completion_chars(completion));

    let reported = completion.usage.unwrap_or_default();
    let input_tokens = reported
        .prompt_tokens
        .map_or(request_tokens, u64::from);
    let output_tokens = reported
        .completion_tokens
        .map_or(reply_tokens, u64::from);

    CallUsage {
        input_tokens,
        output_tokens,
        context_length: request_tokens + reply_tokens,
        context_limit: context_limit.unwrap_or(DEFAULT_CONTEXT_LIMIT),
        cost: pricing_for_model(model_id).estimate_cost(input_tokens, output_tokens),
    }
}
