//! カードの設定。

use std::time::Duration;

/// カードの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardClass {
    /// コプロセッサを搭載し、メールボックス経由でデータをやり取りするカード。
    Coprocessor,
    /// 生のTSをDMAで受け取り、ソフトウェアで分離するカード。
    Software,
}

impl CardClass {
    /// フィルターの最大数を返す。
    #[inline]
    pub fn filter_slots(self) -> usize {
        match self {
            CardClass::Coprocessor => 32,
            CardClass::Software => 256,
        }
    }
}

/// コプロセッサとのやり取りにおける待ち時間。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// コマンドレジスタが空くまでの待ち時間。
    pub command_idle: Duration,
    /// ハンドシェイクレジスタが空くまでの待ち時間。
    pub handshake: Duration,
    /// OSDキューが空くまでの待ち時間。
    pub osd_queue: Duration,
    /// ファームウェアのブロックごとの待ち時間。
    pub boot_block: Duration,
    /// レジスタをポーリングする間隔。
    pub poll_interval: Duration,
    /// PID変更用のロックを待つ時間。
    pub pid_lock: Duration,
    /// ビットマップ転送の完了を待つ時間。
    pub bitmap: Duration,
}

impl Timeouts {
    /// 既定の待ち時間。
    pub const DEFAULT: Timeouts = Timeouts {
        command_idle: Duration::from_millis(50),
        handshake: Duration::from_millis(40),
        osd_queue: Duration::from_secs(1),
        boot_block: Duration::from_millis(50),
        poll_interval: Duration::from_millis(1),
        pid_lock: Duration::from_secs(1),
        bitmap: Duration::from_secs(10),
    };
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts::DEFAULT
    }
}

/// カードの設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardConfig {
    /// カードの種類。
    pub class: CardClass,
    /// 待ち時間。
    pub timeouts: Timeouts,
    /// 映像・音声再生バッファの容量。
    pub av_buffer_size: usize,
    /// 音声再生バッファの容量。
    pub audio_buffer_size: usize,
    /// CI送受信バッファの容量。
    pub ci_buffer_size: usize,
    /// 再生データを受け付けるのに必要な両バッファの空き容量。
    pub playback_free_threshold: usize,
    /// 一度にデコーダーへ渡すPESの最大長。
    pub playback_chunk: usize,
    /// フィード停止時にデコーダーのPIDも解除するかどうか。
    pub pids_off: bool,
    /// 再生停止時に設定し直すアナログ出力のモード。
    pub video_mode: u16,
    /// コプロセッサの生存確認の間隔。
    pub watchdog_interval: Duration,
    /// この回数を超えてコマンドが失敗した場合にコプロセッサが停止したとみなす。
    pub crash_error_threshold: u32,
    /// 割り込みからストリーム処理へ渡すデータの最大待ち数。
    pub delivery_queue: usize,
}

impl CardConfig {
    /// コプロセッサ搭載カードの既定の設定。
    pub const DEFAULT: CardConfig = CardConfig {
        class: CardClass::Coprocessor,
        timeouts: Timeouts::DEFAULT,
        av_buffer_size: 128 * 1024,
        audio_buffer_size: 64 * 1024,
        ci_buffer_size: 8 * 1024,
        playback_free_threshold: 20 * 1024,
        playback_chunk: 2048,
        pids_off: false,
        video_mode: 0,
        watchdog_interval: Duration::from_secs(5),
        crash_error_threshold: 3,
        delivery_queue: 64,
    };

    /// 種類`class`の既定の設定を返す。
    pub fn new(class: CardClass) -> CardConfig {
        CardConfig {
            class,
            ..CardConfig::DEFAULT
        }
    }
}

impl Default for CardConfig {
    fn default() -> Self {
        CardConfig::DEFAULT
    }
}
