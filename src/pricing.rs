//! 模型价格表与成本估算
//!
//! 价格单位：美元 / 百万 token。

use crate::transcript::UsageBlock;

/// 单个模型的价格
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

impl ModelPricing {
    /// 缓存写入按输入价 1.25 倍、缓存读取按 0.1 倍计
    fn from_base(input: f64, output: f64) -> Self {
        Self {
            input,
            output,
            cache_write: input * 1.25,
            cache_read: input * 0.1,
        }
    }
}

/// batch 层折扣
const BATCH_DISCOUNT: f64 = 0.5;

/// 已知模型 (输入价, 输出价)。精确 id 优先，其次按前缀匹配同一系列。
static PRICING_TABLE: &[(&str, (f64, f64))] = &[
    ("claude-opus-4-5-20251101", (15.0, 75.0)),
    ("claude-sonnet-4-20250514", (3.0, 15.0)),
    ("claude-haiku-3-5-20241022", (0.80, 4.0)),
    ("claude-opus-4", (15.0, 75.0)),
    ("claude-sonnet-4", (3.0, 15.0)),
    ("claude-3-7-sonnet", (3.0, 15.0)),
    ("claude-3-5-sonnet", (3.0, 15.0)),
    ("claude-haiku-3-5", (0.80, 4.0)),
    ("claude-3-5-haiku", (0.80, 4.0)),
];

/// 查找模型价格
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    PRICING_TABLE
        .iter()
        .find(|(id, _)| *id == model)
        .or_else(|| PRICING_TABLE.iter().find(|(id, _)| model.starts_with(id)))
        .map(|(_, (input, output))| ModelPricing::from_base(*input, *output))
}

/// 估算一次调用的成本（美元）
///
/// 未知模型返回 `None`，不猜价格。
pub fn estimate_cost(model: Option<&str>, service_tier: Option<&str>, usage: &UsageBlock) -> Option<f64> {
    let pricing = pricing_for(model?)?;
    let per_token = |tokens: Option<i64>, rate: f64| tokens.unwrap_or(0).max(0) as f64 / 1_000_000.0 * rate;

    let cost = per_token(usage.input_tokens, pricing.input)
        + per_token(usage.output_tokens, pricing.output)
        + per_token(usage.cache_creation_tokens, pricing.cache_write)
        + per_token(usage.cache_read_tokens, pricing.cache_read);

    match service_tier {
        Some(tier) if tier.eq_ignore_ascii_case("batch") => Some(cost * BATCH_DISCOUNT),
        _ => Some(cost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: i64, output: i64) -> UsageBlock {
        UsageBlock {
            input_tokens: Some(input),
            output_tokens: Some(output),
            ..Default::default()
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_known_models() {
        let cases = [
            ("claude-opus-4-5-20251101", 15.0, 75.0),
            ("claude-sonnet-4-20250514", 3.0, 15.0),
            ("claude-haiku-3-5-20241022", 0.80, 4.0),
        ];
        for (model, input, output) in cases {
            let cost = estimate_cost(Some(model), None, &usage(1_000_000, 1_000_000)).unwrap();
            assert!(approx(cost, input + output), "{}: {}", model, cost);
        }
    }

    #[test]
    fn test_prefix_match() {
        let p = pricing_for("claude-sonnet-4-5-20250929").unwrap();
        assert!(approx(p.input, 3.0));
        assert!(pricing_for("gpt-4o").is_none());
    }

    #[test]
    fn test_unknown_model_has_no_estimate() {
        assert!(estimate_cost(Some("unknown-model-v99"), None, &usage(1_000_000, 1_000_000)).is_none());
        assert!(estimate_cost(None, None, &usage(1, 1)).is_none());
    }

    #[test]
    fn test_zero_and_missing_tokens() {
        let model = Some("claude-sonnet-4-20250514");
        assert_eq!(estimate_cost(model, None, &usage(0, 0)), Some(0.0));
        assert_eq!(estimate_cost(model, None, &UsageBlock::default()), Some(0.0));
    }

    #[test]
    fn test_cache_tokens() {
        let u = UsageBlock {
            cache_creation_tokens: Some(1_000_000),
            cache_read_tokens: Some(1_000_000),
            ..Default::default()
        };
        let cost = estimate_cost(Some("claude-sonnet-4-20250514"), None, &u).unwrap();
        assert!(approx(cost, 3.75 + 0.3), "{}", cost);
    }

    #[test]
    fn test_batch_tier_discount() {
        let model = Some("claude-sonnet-4-20250514");
        let standard = estimate_cost(model, Some("standard"), &usage(1_000_000, 1_000_000)).unwrap();
        let batch = estimate_cost(model, Some("batch"), &usage(1_000_000, 1_000_000)).unwrap();
        assert!(approx(standard, 18.0));
        assert!(approx(batch, 9.0));
    }
}
