//! 带超时的降级装饰器
//!
//! 模型策略（可选）在显式超时内执行；失败、超时或未启用时同步跑模式匹配。
//! 调用方拿到的永远是 Extraction / Resolution，唯一能看出走了哪条路的是 `ExtractionMode`。

use std::sync::Arc;
use std::time::Duration;

use super::{
    classify_by_cues, Extraction, ExtractionError, ExtractionStrategy, ModelExtractor,
    PatternExtractor,
};
use crate::config::ExtractionSection;
use crate::cycle::Resolution;
use crate::llm::LlmClient;

pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(8);

/// 承诺抽取入口
pub struct FallbackExtractor {
    primary: Option<Arc<dyn ExtractionStrategy>>,
    pattern: PatternExtractor,
    timeout: Duration,
}

impl FallbackExtractor {
    /// 仅模式匹配
    pub fn pattern_only() -> Self {
        Self {
            primary: None,
            pattern: PatternExtractor::new(),
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    /// 模型优先，超时 `timeout` 后降级
    pub fn with_model(primary: Arc<dyn ExtractionStrategy>, timeout: Duration) -> Self {
        Self {
            primary: Some(primary),
            pattern: PatternExtractor::new(),
            timeout,
        }
    }

    /// 按配置组装：model_enabled=false 时不持有模型
    pub fn from_config(cfg: &ExtractionSection, llm: Arc<dyn LlmClient>) -> Self {
        if cfg.model_enabled {
            tracing::info!("Model extraction enabled (timeout {}s)", cfg.timeout_secs);
            Self::with_model(
                Arc::new(ModelExtractor::new(llm)),
                Duration::from_secs(cfg.timeout_secs.max(1)),
            )
        } else {
            tracing::info!("Model extraction disabled, using pattern matching");
            Self::pattern_only()
        }
    }

    pub fn model_enabled(&self) -> bool {
        self.primary.is_some()
    }

    /// 回复 → 承诺；永不失败
    pub async fn extract(&self, text: &str) -> Extraction {
        if let Some(primary) = &self.primary {
            match self.bounded(primary.extract(text)).await {
                Ok(extraction) => return extraction,
                Err(e) => {
                    tracing::warn!("{} extraction failed, falling back to patterns: {}", primary.name(), e);
                }
            }
        }
        self.pattern.extract(text)
    }

    /// 跟进回复 → 完成情况；永不失败
    pub async fn classify(&self, text: &str) -> Resolution {
        if let Some(primary) = &self.primary {
            match self.bounded(primary.classify(text)).await {
                Ok(resolution) => return resolution,
                Err(e) => {
                    tracing::warn!("{} classification failed, falling back to cues: {}", primary.name(), e);
                }
            }
        }
        classify_by_cues(text)
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ExtractionError>>,
    ) -> Result<T, ExtractionError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(self.timeout)),
        }
    }
}

impl Default for FallbackExtractor {
    fn default() -> Self {
        Self::pattern_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::ExtractionMode;
    use crate::llm::MockLlmClient;

    const SAMPLE: &str = "Today: fixed the login bug. Tomorrow: will write tests.";

    fn model(llm: MockLlmClient, timeout: Duration) -> FallbackExtractor {
        FallbackExtractor::with_model(Arc::new(ModelExtractor::new(Arc::new(llm))), timeout)
    }

    #[tokio::test]
    async fn test_timeout_matches_pattern_only() {
        let hanging = model(
            MockLlmClient::hanging(Duration::from_secs(30)),
            Duration::from_millis(50),
        );
        let via_fallback = hanging.extract(SAMPLE).await;
        let direct = FallbackExtractor::pattern_only().extract(SAMPLE).await;
        assert_eq!(via_fallback, direct);
        assert_eq!(via_fallback.mode(), ExtractionMode::Pattern);
    }

    #[tokio::test]
    async fn test_bounded_reports_configured_timeout() {
        let extractor = model(MockLlmClient::replying("{}"), Duration::from_millis(20));
        let err = extractor
            .bounded(std::future::pending::<Result<(), ExtractionError>>())
            .await
            .unwrap_err();
        assert_eq!(err, ExtractionError::Timeout(Duration::from_millis(20)));
        assert!(err.to_string().contains("20ms"));
    }

    #[tokio::test]
    async fn test_model_error_falls_back() {
        let failing = model(MockLlmClient::failing("503"), Duration::from_secs(1));
        let e = failing.extract("busy today, will update later").await;
        assert_eq!(e.mode(), ExtractionMode::Unparsed);
    }

    #[tokio::test]
    async fn test_malformed_model_output_falls_back() {
        let chatty = model(MockLlmClient::replying("I think they fixed a bug"), Duration::from_secs(1));
        assert_eq!(chatty.extract(SAMPLE).await.mode(), ExtractionMode::Pattern);
    }

    #[tokio::test]
    async fn test_model_success_is_model_mode() {
        let good = model(
            MockLlmClient::replying(r#"{"today": "fixed the login bug", "tomorrow": "write tests"}"#),
            Duration::from_secs(1),
        );
        assert_eq!(good.extract(SAMPLE).await.mode(), ExtractionMode::Model);
    }

    #[tokio::test]
    async fn test_classify_falls_back_to_cues() {
        let failing = model(MockLlmClient::failing("down"), Duration::from_secs(1));
        assert_eq!(failing.classify("yes, shipped it").await, Resolution::Completed);
        assert_eq!(
            FallbackExtractor::pattern_only().classify("not yet").await,
            Resolution::Incomplete
        );
    }

    #[test]
    fn test_disabled_config_has_no_model() {
        let cfg = ExtractionSection {
            model_enabled: false,
            timeout_secs: 5,
        };
        let e = FallbackExtractor::from_config(&cfg, Arc::new(MockLlmClient::failing("unused")));
        assert!(!e.model_enabled());
    }
}
