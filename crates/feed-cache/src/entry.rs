//! Cache 항목.
//!
//! ```text
//! created_at          fresh_until               stale_until
//!     │── fresh (그대로 반환) ──│── stale (반환 + 갱신) ──│── 사용 불가
//! ```
//!
//! stale 구간은 신선 구간 뒤에 이어집니다 (`stale_until = fresh_until + stale_ttl`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 시점별 항목 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Cache 조회 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    /// 신선한 값
    Fresh(T),
    /// 만료 임박 값 (갱신 필요)
    Stale(T),
    /// 없음
    Miss,
}

impl<T> CacheLookup<T> {
    /// 값이 있으면 반환 (fresh/stale 무관).
    pub fn into_value(self) -> Option<T> {
        match self {
            CacheLookup::Fresh(value) | CacheLookup::Stale(value) => Some(value),
            CacheLookup::Miss => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheLookup::Fresh(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, CacheLookup::Stale(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheLookup::Miss)
    }
}

/// L1/L2에 저장되는 항목.
///
/// 값은 JSON으로 보관되어 L2 직렬화 형식과 L1 표현이 같습니다.
/// 시각은 모두 epoch 밀리초입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: i64,
    pub fresh_until: i64,
    pub stale_until: i64,
}

impl CacheEntry {
    /// 새 항목 생성.
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        now_ms: i64,
        fresh_ttl: Duration,
        stale_ttl: Duration,
    ) -> Self {
        let fresh_until = now_ms.saturating_add(fresh_ttl.as_millis() as i64);
        let stale_until = fresh_until.saturating_add(stale_ttl.as_millis() as i64);
        Self {
            key: key.into(),
            value,
            created_at: now_ms,
            fresh_until,
            stale_until,
        }
    }

    /// `now_ms` 시점의 상태.
    pub fn freshness(&self, now_ms: i64) -> Freshness {
        if now_ms < self.fresh_until {
            Freshness::Fresh
        } else if now_ms < self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// 사용 불가 시점까지 남은 시간 (L2 TTL).
    pub fn remaining_ttl(&self, now_ms: i64) -> Option<Duration> {
        let remaining = self.stale_until - now_ms;
        (remaining > 0).then(|| Duration::from_millis(remaining as u64))
    }

    /// 생성 후 경과 시간.
    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis((now_ms - self.created_at).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_704_067_200_000;

    #[test]
    fn test_freshness_windows_are_additive() {
        let entry = CacheEntry::new(
            "quotes:AAPL",
            json!({"price": 187.5}),
            NOW,
            Duration::from_secs(60),
            Duration::from_secs(30),
        );

        assert_eq!(entry.stale_until - entry.fresh_until, 30_000);
        assert_eq!(entry.freshness(NOW), Freshness::Fresh);
        assert_eq!(entry.freshness(NOW + 59_999), Freshness::Fresh);
        assert_eq!(entry.freshness(NOW + 60_000), Freshness::Stale);
        assert_eq!(entry.freshness(NOW + 89_999), Freshness::Stale);
        assert_eq!(entry.freshness(NOW + 90_000), Freshness::Expired);
    }

    #[test]
    fn test_remaining_ttl() {
        let entry = CacheEntry::new(
            "k",
            json!(1),
            NOW,
            Duration::from_secs(10),
            Duration::from_secs(5),
        );
        assert_eq!(entry.remaining_ttl(NOW), Some(Duration::from_secs(15)));
        assert_eq!(entry.remaining_ttl(NOW + 15_000), None);
        assert_eq!(entry.age(NOW + 4_000), Duration::from_secs(4));
    }

    #[test]
    fn test_lookup_helpers() {
        assert_eq!(CacheLookup::Stale(3).into_value(), Some(3));
        assert!(CacheLookup::<u8>::Miss.is_miss());
        assert!(CacheLookup::Fresh(1).is_fresh());
    }
}
