//! コプロセッサの生存確認。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};

use crate::card::Card;

/// 一定間隔でコプロセッサのメインループの周回数とコマンドの失敗回数を調べ、
/// 停止していれば復旧させる。
#[derive(Debug)]
pub struct Watchdog {
    card: Arc<Card>,
    interval: Duration,
    threshold: u32,
    last_loops: Option<u16>,
}

impl Watchdog {
    /// `card`を監視する`Watchdog`を生成する。
    pub fn new(card: Arc<Card>) -> Watchdog {
        let interval = card.config().watchdog_interval;
        let threshold = card.config().crash_error_threshold;
        Watchdog {
            card,
            interval,
            threshold,
            last_loops: None,
        }
    }

    /// 1回分の確認を行い、復旧させた場合は`true`を返す。
    ///
    /// 確認から復旧までの間はPID変更用・状態遷移・コマンドチャンネルのロックをすべて保持する。
    /// 前回の復旧に失敗していれば、周回数を確かめずに復旧をやり直す。
    pub fn tick(&mut self) -> bool {
        if !self.card.is_started() {
            return false;
        }
        let _locked = match self.card.lock_exclusive() {
            Ok(locked) => locked,
            Err(e) => {
                log::debug!("watchdog skipped: {}", e);
                return false;
            }
        };

        let channel = self.card.channel();
        let crashed = if self.card.is_ready() {
            let loops = channel.loop_counter();
            let errors = channel.error_count();
            let stalled = self.last_loops == Some(loops);
            self.last_loops = Some(loops);
            if stalled || errors > self.threshold {
                log::warn!("coprocessor crashed (loops {}, errors {})", loops, errors);
                true
            } else {
                false
            }
        } else {
            log::warn!("retrying coprocessor recovery");
            true
        };

        let mut recovered = false;
        if crashed {
            recovered = self.card.recover().is_ok();
            self.last_loops = if recovered {
                // 復旧後は周回数を1つ前として扱う
                Some(channel.loop_counter().wrapping_sub(1))
            } else {
                None
            };
        }
        channel.reset_errors();
        recovered
    }

    /// 新しいスレッドで監視を開始する。
    pub fn spawn(mut self) -> WatchdogHandle {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let stop = Arc::new(AtomicBool::new(false));

        let stopped = stop.clone();
        let thread = std::thread::spawn(move || loop {
            parker.park_timeout(self.interval);
            if stopped.load(Ordering::Acquire) {
                break;
            }
            self.tick();
        });
        WatchdogHandle {
            stop,
            unparker,
            thread,
        }
    }
}

/// 監視スレッドを止めるためのハンドル。
#[derive(Debug)]
pub struct WatchdogHandle {
    stop: Arc<AtomicBool>,
    unparker: Unparker,
    thread: JoinHandle<()>,
}

impl WatchdogHandle {
    /// 監視を止め、スレッドの終了を待つ。
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.unparker.unpark();
        if self.thread.join().is_err() {
            log::error!("watchdog thread panicked");
        }
    }
}
