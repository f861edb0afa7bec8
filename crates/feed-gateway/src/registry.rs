//! Provider 정책 registry.
//!
//! provider별 breaker/limiter/retry/cache 정책을 보관합니다.
//! 등록되지 않은 provider는 설정 파일의 기본 정책을 사용합니다.
//! 모든 정책의 circuit 복구 시간은 저장소 상태 TTL 안에 있어야 합니다.

use std::time::Duration;

use dashmap::DashMap;
use feed_core::{FeedResult, GatewayConfig, ProviderKey, ProviderPolicy};
use tracing::info;

use crate::pipeline::CallOptions;

/// provider 정책 registry.
pub struct ProviderRegistry {
    defaults: ProviderPolicy,
    state_ttl: Duration,
    policies: DashMap<ProviderKey, ProviderPolicy>,
}

impl ProviderRegistry {
    /// 기본 정책과 circuit 상태 TTL로 생성.
    pub fn new(defaults: ProviderPolicy, state_ttl: Duration) -> Self {
        Self {
            defaults,
            state_ttl,
            policies: DashMap::new(),
        }
    }

    /// 설정 파일의 기본 정책과 provider 오버라이드로 생성.
    pub fn from_config(config: &GatewayConfig) -> FeedResult<Self> {
        let registry = Self::new(config.default_policy(), config.store.state_ttl());
        for name in config.providers.keys() {
            let provider = ProviderKey::new(name.as_str())?;
            registry.register(&provider, config.policy_for(&provider))?;
        }
        Ok(registry)
    }

    /// 정책 검증 (상태 TTL 포함).
    pub fn validate(&self, policy: &ProviderPolicy) -> FeedResult<()> {
        policy.validate()?;
        policy.breaker.validate_state_ttl(self.state_ttl)
    }

    /// 정책 등록 (기존 정책 교체).
    pub fn register(&self, provider: &ProviderKey, policy: ProviderPolicy) -> FeedResult<()> {
        self.validate(&policy)?;
        info!(
            provider = %provider,
            algorithm = ?policy.limiter.algorithm,
            failure_threshold = policy.breaker.failure_threshold,
            max_attempts = policy.retry.max_attempts,
            "Provider policy registered"
        );
        self.policies.insert(provider.clone(), policy);
        Ok(())
    }

    /// provider 정책.
    pub fn policy_for(&self, provider: &ProviderKey) -> ProviderPolicy {
        self.policies
            .get(provider)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// 호출 옵션을 적용한 정책.
    pub fn effective_policy(
        &self,
        provider: &ProviderKey,
        options: &CallOptions,
    ) -> FeedResult<ProviderPolicy> {
        let mut policy = self.policy_for(provider);
        if let Some(breaker) = &options.breaker {
            policy.breaker = breaker.clone();
        }
        if let Some(limiter) = &options.limiter {
            policy.limiter = limiter.clone();
        }
        if let Some(retry) = &options.retry {
            policy.retry = retry.clone();
        }
        if let Some(cache) = &options.cache {
            policy.cache = cache.clone();
        }
        if options.has_overrides() {
            self.validate(&policy)?;
        }
        Ok(policy)
    }

    /// 등록된 provider 목록.
    pub fn providers(&self) -> Vec<ProviderKey> {
        let mut providers: Vec<ProviderKey> =
            self.policies.iter().map(|entry| entry.key().clone()).collect();
        providers.sort();
        providers
    }
}
