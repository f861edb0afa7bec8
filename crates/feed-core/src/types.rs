//! Provider 식별자.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// 외부 데이터 제공자 식별자.
///
/// circuit breaker, rate limiter, cache 상태는 모두 이 키 단위로 분리됩니다.
/// 저장소 키의 일부로 사용되므로 공백과 `:`는 허용하지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderKey(String);

impl ProviderKey {
    /// 새 provider 키 생성.
    pub fn new(name: impl Into<String>) -> Result<Self, FeedError> {
        let name = name.into();
        if name.is_empty() {
            return Err(FeedError::Validation("provider key must not be empty".to_string()));
        }
        if name.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(FeedError::Validation(format!(
                "provider key '{}' contains whitespace or ':'",
                name
            )));
        }
        Ok(Self(name))
    }

    /// 문자열 참조 반환.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProviderKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ProviderKey {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProviderKey {
    type Error = FeedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProviderKey> for String {
    fn from(key: ProviderKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_key_validation() {
        assert!(ProviderKey::new("yahoo").is_ok());
        assert!(ProviderKey::new("alpha_vantage").is_ok());
        assert!(ProviderKey::new("").is_err());
        assert!(ProviderKey::new("alpha vantage").is_err());
        assert!(ProviderKey::new("cb:yahoo").is_err());
    }

    #[test]
    fn test_provider_key_serde() {
        let key: ProviderKey = serde_json::from_str("\"finnhub\"").unwrap();
        assert_eq!(key.as_str(), "finnhub");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"finnhub\"");

        let invalid: Result<ProviderKey, _> = serde_json::from_str("\"\"");
        assert!(invalid.is_err());
    }
}
