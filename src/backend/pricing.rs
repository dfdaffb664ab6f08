//! Static per-model price table and the per-call usage log line.

use tracing::info;

/// USD per 1K tokens: (model, input, output).
const PRICES: &[(&str, f64, f64)] = &[
    ("gpt-3.5-turbo", 0.0015, 0.002),
    ("gpt-3.5-turbo-16k", 0.003, 0.004),
    ("gpt-4", 0.03, 0.06),
    ("gpt-4-32k", 0.06, 0.12),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-4o", 0.005, 0.015),
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("qwen-plus", 0.0004, 0.0012),
    ("qwen1.5-110-chat", 0.0007, 0.0014),
    ("deepseek-chat", 0.00027, 0.0011),
    ("deepseek-reasoner", 0.00055, 0.00219),
    ("deepseek-ai/DeepSeek-V3", 0.00027, 0.0011),
    ("deepseek-ai/DeepSeek-R1", 0.00055, 0.00219),
];

/// Cost in USD of one call; unknown models cost nothing.
pub fn prompt_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    PRICES
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|(_, input, output)| {
            f64::from(prompt_tokens) * input / 1000.0 + f64::from(completion_tokens) * output / 1000.0
        })
        .unwrap_or(0.0)
}

/// Emit the usage line for one call and return its cost.
pub fn log_usage(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    let cost = prompt_cost(model, prompt_tokens, completion_tokens);
    info!(
        model,
        "usage: prompt_tokens={} completion_tokens={} total_tokens={} cost=${:.6}",
        prompt_tokens,
        completion_tokens,
        prompt_tokens + completion_tokens,
        cost
    );
    cost
}
