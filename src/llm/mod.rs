//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）
//!
//! 仅服务于模型抽取：把站会回复交给模型拆成 today / tomorrow 两段，失败由抽取层降级。

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::LlmClient;

use crate::config::LlmSection;

/// 按配置创建 LLM 客户端：有 API Key 时走 OpenAI 兼容端点，否则退回 Mock（永远失败，抽取会降级到模式匹配）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let api_key = cfg
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());

    match api_key {
        Some(key) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.model);
            Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, Some(&key)))
        }
        None => {
            tracing::warn!("No LLM API key set, model extraction will always fall back to patterns");
            Arc::new(MockLlmClient::failing("no api key configured"))
        }
    }
}
