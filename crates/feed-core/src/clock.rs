//! 시간 소스.
//!
//! 분산 상태(circuit, rate limit, cache entry)는 epoch 밀리초로 기록되므로
//! 모든 컴포넌트는 `Clock`을 주입받아 현재 시각을 얻습니다.
//! 테스트에서는 `ManualClock`으로 시간을 직접 이동시킵니다.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// 현재 시각 제공자.
pub trait Clock: Send + Sync + fmt::Debug {
    /// 현재 UTC 시각.
    fn now(&self) -> DateTime<Utc>;

    /// 현재 시각 (epoch 밀리초).
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// 공유 시계 핸들.
pub type SharedClock = Arc<dyn Clock>;

/// 시스템 시계.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// 공유 핸들로 생성.
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 수동으로 진행시키는 시계.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// 주어진 시각에서 시작하는 시계 생성.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// 2024-01-01 00:00:00 UTC에서 시작하는 시계.
    pub fn starting_at_epoch_2024() -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicI64::new(1_704_067_200_000),
        })
    }

    /// 시간 진행.
    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// 특정 시각으로 설정.
    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn now_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
