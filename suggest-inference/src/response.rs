use crate::types::GenerationResult;

/// Maximum length of a suggestion, in characters
pub const MAX_SUGGESTION_CHARS: usize = 256;

/// Extracts the newly generated text from the decoded output.
///
/// The prompt is cut from the front of `decoded` by character count, not
/// at a token boundary, so a partial token at the seam may be clipped or
/// repeated. When `decoded` is shorter than the prompt the suggestion is
/// empty. The result holds at most [`MAX_SUGGESTION_CHARS`] characters.
pub fn extract_suggestion(prompt: &str, decoded: &str) -> String {
    let prompt_chars = prompt.chars().count();
    decoded
        .chars()
        .skip(prompt_chars)
        .take(MAX_SUGGESTION_CHARS)
        .collect()
}

/// Builds the response for `prompt` out of the full decoded text
pub fn build_result(prompt: String, decoded: &str) -> GenerationResult {
    let suggestion = extract_suggestion(&prompt, decoded);
    GenerationResult { prompt, suggestion }
}
