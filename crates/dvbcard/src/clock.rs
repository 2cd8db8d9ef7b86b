//! ポーリング用の時計。

use std::time::{Duration, Instant};

use crate::error::{Error, Phase, Result};

/// 現在時刻の取得と待機を抽象化する。
pub trait Clock: Send + Sync {
    /// 現在時刻を返す。
    fn now(&self) -> Instant;

    /// `duration`だけ待機する。
    fn sleep(&self, duration: Duration);
}

/// 実際の時刻を使う[`Clock`]。
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// `cond`が満たされるまで`interval`ごとに確認する。
///
/// `timeout`を過ぎても満たされない場合は`Error::Timeout(phase)`を返す。
pub(crate) fn poll_until<F: FnMut() -> bool>(
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
    phase: Phase,
    mut cond: F,
) -> Result<()> {
    let deadline = clock.now() + timeout;
    loop {
        let expired = clock.now() >= deadline;
        if cond() {
            return Ok(());
        }
        if expired {
            return Err(Error::Timeout(phase));
        }
        clock.sleep(interval);
    }
}
