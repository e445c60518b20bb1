//! 计费引擎：纯计算。所有乘法都在 `Decimal` 上完成，最后一次性取整。

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Map, Value, json};

use crate::config::{PricingConfig, SupplementRule};
use crate::error::{ErrorCode, RelayError};
use crate::request::{ResponsesUsageInfo, TOOL_FILE_SEARCH, TOOL_WEB_SEARCH_PREVIEW, Usage};

const THOUSAND: i64 = 1_000;
const MILLION: i64 = 1_000_000;

/// 某个模型在某个分组下的全部价格因子。
#[derive(Debug, Clone, PartialEq)]
pub struct PriceData {
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub cache_ratio: f64,
    pub image_ratio: f64,
    pub group_ratio: f64,
    pub model_price: f64,
    pub use_price: bool,
    /// 预扣费估算值。
    pub pre_consume_quota: i64,
}

fn dec(value: f64) -> Decimal {
    Decimal::from_str(&value.to_string())
        .or_else(|_| Decimal::try_from(value))
        .unwrap_or_default()
}

fn to_quota(value: Decimal) -> i64 {
    i64::try_from(value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .unwrap_or(i64::MAX)
}

fn lookup(table: &std::collections::HashMap<String, f64>, key: &str, fallback: f64) -> f64 {
    table.get(key).copied().unwrap_or(fallback)
}

/// 解析价格因子并计算预扣费估算。既没有价格也没有倍率的模型视为未定价。
pub fn resolve_price(
    config: &PricingConfig,
    model: &str,
    group: &str,
    prompt_tokens: i64,
    max_tokens: i64,
) -> Result<PriceData, RelayError> {
    let group_ratio = lookup(&config.group_ratio, group, 1.0);
    let model_price = config.model_price.get(model).copied();
    let model_ratio = config.model_ratio.get(model).copied();

    if model_price.is_none() && model_ratio.is_none() {
        return Err(RelayError::new(
            ErrorCode::ModelPriceError,
            format!("model {model} ratio or price not set"),
        ));
    }

    let mut price = PriceData {
        model_ratio: model_ratio.unwrap_or(0.0),
        completion_ratio: lookup(&config.completion_ratio, model, 1.0),
        cache_ratio: lookup(&config.cache_ratio, model, 1.0),
        image_ratio: lookup(&config.image_ratio, model, 1.0),
        group_ratio,
        model_price: model_price.unwrap_or(0.0),
        use_price: model_price.is_some(),
        pre_consume_quota: 0,
    };

    let estimate = if price.use_price {
        dec(price.model_price) * dec(config.quota_per_unit) * dec(group_ratio)
    } else {
        let tokens = if max_tokens > 0 {
            prompt_tokens + max_tokens
        } else {
            config.pre_consumed_tokens
        };
        Decimal::from(tokens) * dec(price.model_ratio) * dec(group_ratio)
    };
    price.pre_consume_quota = i64::try_from(estimate.trunc()).unwrap_or(i64::MAX);
    Ok(price)
}

/// 内置 web search 工具每千次调用的价格。
pub fn web_search_price_per_thousand(model: &str, context_size: &str) -> f64 {
    let mini = model.contains("mini");
    match (mini, context_size) {
        (true, "high") => 30.0,
        (true, "low") => 25.0,
        (true, _) => 27.5,
        (false, "high") => 50.0,
        (false, "low") => 30.0,
        (false, _) => 35.0,
    }
}

/// 补充计费规则：找出断点严格小于 prompt token 数的最高一条。
pub fn select_supplement(rules: &[SupplementRule], prompt_tokens: i64) -> Option<SupplementRule> {
    let mut sorted = rules.to_vec();
    sorted.sort_by_key(|rule| rule.token_count);
    sorted
        .into_iter()
        .rev()
        .find(|rule| prompt_tokens > rule.token_count)
}

/// 结算所需的全部输入。
#[derive(Debug, Clone, Copy)]
pub struct BillingInput<'a> {
    pub usage: &'a Usage,
    pub price: &'a PriceData,
    pub model_name: &'a str,
    pub tools: Option<&'a ResponsesUsageInfo>,
    /// chat 请求里 `web_search_options.search_context_size`。
    pub search_context_size: Option<&'a str>,
    pub claude_web_search_requests: i64,
    pub supplements: &'a [SupplementRule],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Surcharge {
    pub calls: i64,
    pub price: f64,
    pub quota: Decimal,
}

/// 一次结算的计算结果与明细。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaBreakdown {
    pub quota: i64,
    pub base_quota: Decimal,
    pub web_search: Option<Surcharge>,
    pub claude_web_search: Option<Surcharge>,
    pub file_search: Option<Surcharge>,
    pub audio_input: Option<Surcharge>,
    pub supplement: Option<SupplementRule>,
    pub content: String,
}

impl QuotaBreakdown {
    /// 写入消费日志 `other` 字段的计费标记。
    pub fn other_info(&self, input: &BillingInput<'_>) -> Map<String, Value> {
        let price = input.price;
        let details = input.usage.details();
        let mut other = Map::new();
        other.insert("model_ratio".into(), json!(price.model_ratio));
        other.insert("group_ratio".into(), json!(price.group_ratio));
        other.insert("completion_ratio".into(), json!(price.completion_ratio));
        other.insert("cache_tokens".into(), json!(details.cached_tokens));
        other.insert("cache_ratio".into(), json!(price.cache_ratio));
        other.insert("model_price".into(), json!(price.model_price));
        if details.image_tokens != 0 {
            other.insert("image".into(), json!(true));
            other.insert("image_ratio".into(), json!(price.image_ratio));
            other.insert("image_output".into(), json!(details.image_tokens));
        }
        if let Some(search) = self.web_search.as_ref().or(self.claude_web_search.as_ref()) {
            other.insert("web_search".into(), json!(true));
            other.insert("web_search_call_count".into(), json!(search.calls));
            other.insert("web_search_price".into(), json!(search.price));
        }
        if let Some(file) = self.file_search.as_ref() {
            other.insert("file_search".into(), json!(true));
            other.insert("file_search_call_count".into(), json!(file.calls));
            other.insert("file_search_price".into(), json!(file.price));
        }
        if let Some(audio) = self.audio_input.as_ref() {
            other.insert("audio_input_separate_price".into(), json!(true));
            other.insert("audio_input_token_count".into(), json!(audio.calls));
            other.insert("audio_input_price".into(), json!(audio.price));
        }
        if let Some(rule) = self.supplement {
            other.insert("supplement_token_count".into(), json!(rule.token_count));
            other.insert("supplement_multiplied".into(), json!(rule.multiplied));
        }
        other
    }
}

/// 按实际用量计算最终额度。
pub fn compute_quota(config: &PricingConfig, input: &BillingInput<'_>) -> QuotaBreakdown {
    let price = input.price;
    let usage = input.usage;
    let details = usage.details();
    let group = dec(price.group_ratio);
    let per_unit = dec(config.quota_per_unit);
    let mut notes: Vec<String> = Vec::new();
    let mut breakdown = QuotaBreakdown::default();

    // 内置 web search：结构化工具信息优先，否则按 search-preview 模型计一次。
    if let Some(tools) = input.tools {
        if let Some(tool) = tools.tool(TOOL_WEB_SEARCH_PREVIEW)
            && tool.call_count > 0
        {
            let unit_price = web_search_price_per_thousand(input.model_name, &tool.search_context_size);
            let quota = dec(unit_price) * Decimal::from(tool.call_count) / Decimal::from(THOUSAND)
                * group
                * per_unit;
            notes.push(format!(
                "web search {} calls, context size {}, cost {}",
                tool.call_count, tool.search_context_size, quota
            ));
            breakdown.web_search = Some(Surcharge {
                calls: tool.call_count,
                price: unit_price,
                quota,
            });
        }
    } else if input.model_name.ends_with("search-preview") {
        let size = input
            .search_context_size
            .filter(|size| !size.is_empty())
            .unwrap_or("medium");
        let unit_price = web_search_price_per_thousand(input.model_name, size);
        let quota = dec(unit_price) / Decimal::from(THOUSAND) * group * per_unit;
        notes.push(format!("web search 1 call, context size {size}, cost {quota}"));
        breakdown.web_search = Some(Surcharge {
            calls: 1,
            price: unit_price,
            quota,
        });
    }

    if input.claude_web_search_requests > 0 {
        let unit_price = config.claude_web_search_price;
        let quota = dec(unit_price) / Decimal::from(THOUSAND)
            * group
            * per_unit
            * Decimal::from(input.claude_web_search_requests);
        notes.push(format!(
            "claude web search {} calls, cost {quota}",
            input.claude_web_search_requests
        ));
        breakdown.claude_web_search = Some(Surcharge {
            calls: input.claude_web_search_requests,
            price: unit_price,
            quota,
        });
    }

    if let Some(tool) = input.tools.and_then(|tools| tools.tool(TOOL_FILE_SEARCH))
        && tool.call_count > 0
    {
        let unit_price = config.file_search_price;
        let quota = dec(unit_price) * Decimal::from(tool.call_count) / Decimal::from(THOUSAND)
            * group
            * per_unit;
        notes.push(format!("file search {} calls, cost {quota}", tool.call_count));
        breakdown.file_search = Some(Surcharge {
            calls: tool.call_count,
            price: unit_price,
            quota,
        });
    }

    let base = if price.use_price {
        dec(price.model_price) * per_unit * group
    } else {
        let ratio = dec(price.model_ratio) * group;
        let mut base_tokens = Decimal::from(usage.prompt_tokens);
        let mut weighted = Decimal::ZERO;
        if details.cached_tokens != 0 {
            base_tokens -= Decimal::from(details.cached_tokens);
            weighted += Decimal::from(details.cached_tokens) * dec(price.cache_ratio);
        }
        if details.image_tokens != 0 {
            base_tokens -= Decimal::from(details.image_tokens);
            weighted += Decimal::from(details.image_tokens) * dec(price.image_ratio);
        }
        if details.audio_tokens != 0 {
            let audio_price = config
                .audio_input_price
                .get(input.model_name)
                .copied()
                .unwrap_or(0.0);
            if audio_price > 0.0 {
                base_tokens -= Decimal::from(details.audio_tokens);
                let quota = dec(audio_price) / Decimal::from(MILLION)
                    * Decimal::from(details.audio_tokens)
                    * group
                    * per_unit;
                notes.push(format!("audio input cost {quota}"));
                breakdown.audio_input = Some(Surcharge {
                    calls: details.audio_tokens,
                    price: audio_price,
                    quota,
                });
            }
        }
        let completion = Decimal::from(usage.completion_tokens) * dec(price.completion_ratio);
        let mut base = (base_tokens + weighted + completion) * ratio;
        if !ratio.is_zero() && to_quota(base) <= 0 {
            base = Decimal::ONE;
        }
        base
    };
    breakdown.base_quota = base;

    let mut total = base;
    for surcharge in [
        &breakdown.web_search,
        &breakdown.claude_web_search,
        &breakdown.file_search,
        &breakdown.audio_input,
    ]
    .into_iter()
    .flatten()
    {
        total += surcharge.quota;
    }

    if let Some(rule) = select_supplement(input.supplements, usage.prompt_tokens) {
        total *= Decimal::from(rule.multiplied);
        notes.push(format!(
            "supplement rule applied: prompt > {} tokens billed x{}",
            rule.token_count, rule.multiplied
        ));
        breakdown.supplement = Some(rule);
    }

    breakdown.quota = to_quota(total);
    let mut content = if price.use_price {
        format!(
            "model price {:.2}, group ratio {:.2}",
            price.model_price, price.group_ratio
        )
    } else {
        format!(
            "model ratio {:.2}, completion ratio {:.2}, group ratio {:.2}",
            price.model_ratio, price.completion_ratio, price.group_ratio
        )
    };
    for note in notes {
        content.push_str(", ");
        content.push_str(&note);
    }
    breakdown.content = content;
    breakdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{BuiltInTool, PromptTokensDetails};
    use std::collections::HashMap;

    fn pricing() -> PricingConfig {
        PricingConfig {
            model_ratio: HashMap::from([
                ("gpt-4o".to_string(), 2.5),
                ("gpt-4o-mini-search-preview".to_string(), 0.075),
                ("tiny".to_string(), 0.0001),
            ]),
            completion_ratio: HashMap::from([("gpt-4o".to_string(), 4.0)]),
            cache_ratio: HashMap::from([("gpt-4o".to_string(), 0.5)]),
            model_price: HashMap::from([("dall-e-3".to_string(), 0.02)]),
            group_ratio: HashMap::from([("vip".to_string(), 0.5)]),
            audio_input_price: HashMap::from([("gemini-2.0-flash".to_string(), 0.7)]),
            ..PricingConfig::default()
        }
    }

    fn bill(config: &PricingConfig, model: &str, usage: Usage) -> QuotaBreakdown {
        let price = resolve_price(config, model, "default", usage.prompt_tokens, 0).unwrap();
        compute_quota(
            config,
            &BillingInput {
                usage: &usage,
                price: &price,
                model_name: model,
                tools: None,
                search_context_size: None,
                claude_web_search_requests: 0,
                supplements: &[],
            },
        )
    }

    #[test]
    fn unpriced_models_are_rejected() {
        let err = resolve_price(&pricing(), "unknown", "default", 10, 0).unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelPriceError);
    }

    #[test]
    fn pre_consume_uses_max_tokens_or_default() {
        let config = pricing();
        let price = resolve_price(&config, "gpt-4o", "default", 100, 900).unwrap();
        assert_eq!(price.pre_consume_quota, 2500);
        let price = resolve_price(&config, "gpt-4o", "vip", 100, 0).unwrap();
        assert_eq!(price.pre_consume_quota, 625);
        let price = resolve_price(&config, "dall-e-3", "default", 100, 0).unwrap();
        assert!(price.use_price);
        assert_eq!(price.pre_consume_quota, 10_000);
    }

    #[test]
    fn ratio_mode_weights_cached_tokens() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 500,
            total_tokens: 1500,
            prompt_tokens_details: Some(PromptTokensDetails {
                cached_tokens: 200,
                ..PromptTokensDetails::default()
            }),
        };
        let breakdown = bill(&pricing(), "gpt-4o", usage);
        // (800 + 200*0.5 + 500*4) * 2.5
        assert_eq!(breakdown.quota, 7250);
        assert!(breakdown.content.contains("model ratio 2.50"));
    }

    #[test]
    fn flat_price_mode_ignores_tokens() {
        let breakdown = bill(&pricing(), "dall-e-3", Usage::new(5000, 5000));
        assert_eq!(breakdown.quota, 10_000);
    }

    #[test]
    fn tiny_ratio_product_floors_to_one() {
        let breakdown = bill(&pricing(), "tiny", Usage::new(10, 0));
        assert_eq!(breakdown.quota, 1);
    }

    #[test]
    fn decimal_math_does_not_drift() {
        let mut config = pricing();
        config.model_ratio.insert("drift".into(), 0.1);
        config.group_ratio.insert("default".into(), 0.3);
        let breakdown = bill(&config, "drift", Usage::new(50, 0));
        // 50 * 0.1 * 0.3 is exactly 1.5, so the midpoint rounds away from zero.
        assert_eq!(breakdown.base_quota, Decimal::from_str("1.5").unwrap());
        assert_eq!(breakdown.quota, 2);
    }

    #[test]
    fn billing_is_monotonic_in_tokens() {
        let config = pricing();
        for completion in [0, 7, 70] {
            let mut last = 0;
            for prompt in [1, 10, 100, 1000, 10_000] {
                let quota = bill(&config, "gpt-4o", Usage::new(prompt, completion)).quota;
                assert!(quota >= last);
                last = quota;
            }
        }
        for prompt in [1, 100] {
            let mut last = 0;
            for completion in [0, 1, 5, 50, 500] {
                let quota = bill(&config, "gpt-4o", Usage::new(prompt, completion)).quota;
                assert!(quota >= last);
                last = quota;
            }
        }
    }

    #[test]
    fn supplement_selects_highest_breakpoint_below_prompt() {
        let rules = vec![
            SupplementRule { token_count: 5000, multiplied: 3 },
            SupplementRule { token_count: 1000, multiplied: 2 },
        ];
        assert_eq!(select_supplement(&rules, 6000).map(|r| r.multiplied), Some(3));
        assert_eq!(select_supplement(&rules, 2000).map(|r| r.multiplied), Some(2));
        assert_eq!(select_supplement(&rules, 1000), None);
        assert_eq!(select_supplement(&rules, 500), None);
    }

    #[test]
    fn supplement_multiplies_entire_cost() {
        let config = pricing();
        let usage = Usage::new(2000, 0);
        let price = resolve_price(&config, "gpt-4o", "default", 2000, 0).unwrap();
        let rules = [SupplementRule { token_count: 1000, multiplied: 2 }];
        let breakdown = compute_quota(
            &config,
            &BillingInput {
                usage: &usage,
                price: &price,
                model_name: "gpt-4o",
                tools: None,
                search_context_size: None,
                claude_web_search_requests: 0,
                supplements: &rules,
            },
        );
        assert_eq!(breakdown.quota, 10_000);
        assert!(breakdown.content.contains("x2"));
    }

    #[test]
    fn web_search_surcharges_are_added() {
        let config = pricing();
        let usage = Usage::new(0, 0);
        let price = resolve_price(&config, "gpt-4o", "default", 0, 0).unwrap();
        let tools = ResponsesUsageInfo {
            built_in_tools: HashMap::from([(
                TOOL_WEB_SEARCH_PREVIEW.to_string(),
                BuiltInTool {
                    call_count: 2,
                    search_context_size: "high".into(),
                },
            )]),
        };
        let input = BillingInput {
            usage: &usage,
            price: &price,
            model_name: "gpt-4o",
            tools: Some(&tools),
            search_context_size: None,
            claude_web_search_requests: 3,
            supplements: &[],
        };
        let breakdown = compute_quota(&config, &input);
        // 1 (floor) + 50*2/1000*500000 + 10/1000*500000*3
        assert_eq!(breakdown.quota, 1 + 50_000 + 15_000);
        let other = breakdown.other_info(&input);
        assert_eq!(other["web_search_call_count"], json!(2));
    }

    #[test]
    fn search_preview_models_pay_one_call_without_tool_info() {
        let breakdown = bill(&pricing(), "gpt-4o-mini-search-preview", Usage::new(0, 0));
        assert_eq!(breakdown.web_search.as_ref().unwrap().price, 27.5);
        assert_eq!(breakdown.quota, 1 + 13_750);
    }

    #[test]
    fn audio_input_is_billed_separately() {
        let mut config = pricing();
        config.model_ratio.insert("gemini-2.0-flash".into(), 1.0);
        let usage = Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 0,
            total_tokens: 1_000_000,
            prompt_tokens_details: Some(PromptTokensDetails {
                audio_tokens: 1_000_000,
                ..PromptTokensDetails::default()
            }),
        };
        let breakdown = bill(&config, "gemini-2.0-flash", usage);
        // base tokens drop to 0 -> floored to 1; audio = 0.7 * 500000
        assert_eq!(breakdown.quota, 1 + 350_000);
        assert!(breakdown.audio_input.is_some());
    }
}
