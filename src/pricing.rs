use tracing::warn;

/// Per-1K-token USD prices for one Bedrock model or inference profile
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    /// 0.0 means no cache-specific price; fall back to input_per_1k * 0.1
    pub cache_read_per_1k: f64,
    /// 0.0 means no cache-specific price; fall back to input_per_1k
    pub cache_write_per_1k: f64,
}

/// Static pricing catalog, keyed by model id, inference-profile id, or
/// application-profile ARN. Immutable after init; unknown ids cost zero.
/// Format: (id, input, output, cache_read, cache_write) in $/1K tokens.
static PRICING_TABLE: &[(&str, f64, f64, f64, f64)] = &[
    // Claude 3 family
    ("anthropic.claude-3-opus-20240229-v1:0", 0.015, 0.075, 0.0, 0.0),
    ("anthropic.claude-3-sonnet-20240229-v1:0", 0.003, 0.015, 0.0, 0.0),
    ("anthropic.claude-3-haiku-20240307-v1:0", 0.00025, 0.00125, 0.0, 0.0),
    // Claude 3.5 family
    ("anthropic.claude-3-5-sonnet-20240620-v1:0", 0.003, 0.015, 0.0, 0.0),
    ("anthropic.claude-3-5-sonnet-20241022-v2:0", 0.003, 0.015, 0.0, 0.0),
    ("anthropic.claude-3-5-haiku-20241022-v1:0", 0.001, 0.005, 0.0, 0.0),
    // Claude Sonnet 4.5 inference profiles
    ("us.anthropic.claude-sonnet-4-5-v2:0", 0.003, 0.015, 0.0003, 0.00375),
    ("eu.anthropic.claude-sonnet-4-5-v2:0", 0.003, 0.015, 0.0003, 0.00375),
    ("eu.anthropic.claude-sonnet-4-5-20250929-v1:0", 0.003, 0.015, 0.0003, 0.00375),
    // Application inference profiles (Claude Sonnet 4.5)
    (
        "arn:aws:bedrock:eu-west-1:701055077130:application-inference-profile/hjy3duh3aoos",
        0.003, 0.015, 0.0003, 0.00375,
    ),
    (
        "arn:aws:bedrock:eu-west-1:701055077130:application-inference-profile/kb2twga41cr4",
        0.003, 0.015, 0.0003, 0.00375,
    ),
    // Amazon Titan
    ("amazon.titan-text-express-v1", 0.0002, 0.0006, 0.0, 0.0),
    ("amazon.titan-text-lite-v1", 0.00015, 0.0002, 0.0, 0.0),
    ("amazon.titan-text-premier-v1:0", 0.0005, 0.0015, 0.0, 0.0),
    // AI21 Labs Jurassic
    ("ai21.j2-ultra-v1", 0.0188, 0.0188, 0.0, 0.0),
    ("ai21.j2-mid-v1", 0.0125, 0.0125, 0.0, 0.0),
    // Cohere
    ("cohere.command-text-v14", 0.0015, 0.002, 0.0, 0.0),
    ("cohere.command-light-text-v14", 0.0003, 0.0006, 0.0, 0.0),
    // Meta Llama
    ("meta.llama3-8b-instruct-v1:0", 0.0003, 0.0006, 0.0, 0.0),
    ("meta.llama3-70b-instruct-v1:0", 0.00265, 0.0035, 0.0, 0.0),
    // Mistral AI
    ("mistral.mistral-7b-instruct-v0:2", 0.00015, 0.0002, 0.0, 0.0),
    ("mistral.mixtral-8x7b-instruct-v0:1", 0.00045, 0.0007, 0.0, 0.0),
    ("mistral.mistral-large-2402-v1:0", 0.008, 0.024, 0.0, 0.0),
];

pub fn lookup(model_id: &str) -> Option<ModelPricing> {
    PRICING_TABLE
        .iter()
        .find(|(id, ..)| *id == model_id)
        .map(|&(_, input, output, cache_read, cache_write)| ModelPricing {
            input_per_1k: input,
            output_per_1k: output,
            cache_read_per_1k: cache_read,
            cache_write_per_1k: cache_write,
        })
}

/// Cost of one request in USD. Cache tokens are carved out of input_tokens:
/// only the remainder is billed at the full input rate. Unknown models cost
/// zero rather than failing the request.
pub fn calculate_cost(
    model_id: &str,
    input_tokens: u64,
    output_tokens: u64,
    cache_read_tokens: u64,
    cache_write_tokens: u64,
) -> f64 {
    let Some(pricing) = lookup(model_id) else {
        warn!(model_id, "pricing not found for model, recording cost as 0");
        return 0.0;
    };

    let normal_input = input_tokens.saturating_sub(cache_read_tokens + cache_write_tokens);

    let cache_read_rate = if pricing.cache_read_per_1k > 0.0 {
        pricing.cache_read_per_1k
    } else {
        pricing.input_per_1k * 0.1
    };
    let cache_write_rate = if pricing.cache_write_per_1k > 0.0 {
        pricing.cache_write_per_1k
    } else {
        pricing.input_per_1k
    };

    (normal_input as f64 / 1000.0) * pricing.input_per_1k
        + (output_tokens as f64 / 1000.0) * pricing.output_per_1k
        + (cache_read_tokens as f64 / 1000.0) * cache_read_rate
        + (cache_write_tokens as f64 / 1000.0) * cache_write_rate
}
