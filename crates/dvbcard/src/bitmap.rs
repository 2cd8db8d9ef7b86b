//! OSDビットマップの転送待ち。

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Phase, Result};

#[derive(Debug, Default)]
struct State {
    data: Vec<u8>,
    pos: usize,
    active: bool,
    loaded: bool,
    cancelled: bool,
}

/// コプロセッサの要求に応じて少しずつ送るビットマップ。
///
/// 同時に転送できるビットマップは1つだけ。
#[derive(Debug, Default)]
pub struct BitmapQueue {
    state: Mutex<State>,
    cond: Condvar,
}

impl BitmapQueue {
    /// 空の`BitmapQueue`を生成する。
    pub fn new() -> BitmapQueue {
        BitmapQueue::default()
    }

    /// 転送するビットマップを設定する。
    pub fn stage(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.active {
            return Err(Error::Busy);
        }
        *state = State {
            data: data.to_vec(),
            active: true,
            ..State::default()
        };
        Ok(())
    }

    /// 転送中かどうかを返す。
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// コプロセッサが`requested`バイトを要求したときに送るデータを`dest`へ書き込み、その長さを返す。
    ///
    /// `requested`が0の場合は転送の完了を意味する。
    pub fn next_chunk(&self, requested: usize, dest: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        if !state.active {
            log::debug!("bitmap request without upload ({} bytes)", requested);
            return 0;
        }
        if requested == 0 {
            state.loaded = true;
            self.cond.notify_all();
            return 0;
        }

        let len = requested.min(state.data.len() - state.pos).min(dest.len());
        dest[..len].copy_from_slice(&state.data[state.pos..state.pos + len]);
        state.pos += len;
        len
    }

    /// 転送の完了を最大`timeout`だけ待ち、転送を終える。
    pub fn wait_loaded(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let result = loop {
            if state.loaded {
                break Ok(());
            }
            if state.cancelled {
                break Err(Error::Closed);
            }
            if self.cond.wait_for(&mut state, timeout).timed_out() {
                break if state.loaded {
                    Ok(())
                } else {
                    Err(Error::Timeout(Phase::Bitmap))
                };
            }
        };
        state.active = false;
        state.data = Vec::new();
        result
    }

    /// 転送を取りやめ、待機中の呼び出しを起こす。
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if state.active {
            state.cancelled = true;
            self.cond.notify_all();
        }
    }

    /// 待機する者がいない転送を破棄する。
    pub(crate) fn discard(&self) {
        *self.state.lock() = State::default();
    }
}
