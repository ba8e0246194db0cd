//! Prompt templates for news analysis.

/// Literal example of the expected output, embedded in the strict retry prompt.
pub const RESPONSE_TEMPLATE: &str = r#"{"tickers":["AAPL"],"sentiment":"neutral","confidence":0.5,"reasoning_summary":"Short reason."}"#;

/// First-attempt prompt: describes the schema in prose.
pub fn build_prompt(input_text: &str) -> String {
    format!(
        "You are a financial news analyst. \
         Analyze the news below and output ONLY valid JSON with keys: \
         tickers (list of strings), sentiment (positive|neutral|negative), \
         confidence (0..1), reasoning_summary (<=280 chars). \
         No markdown, no extra text.\n\n\
         NEWS:\n{input_text}\n"
    )
}

/// Retry prompt: embeds the exact JSON shape to correct format drift.
pub fn build_retry_prompt(input_text: &str) -> String {
    format!(
        "STRICT MODE: Output ONLY JSON matching this exact schema. \
         Do not include any extra keys, markdown, or commentary.\n\
         TEMPLATE:\n{RESPONSE_TEMPLATE}\n\n\
         NEWS:\n{input_text}\n"
    )
}
