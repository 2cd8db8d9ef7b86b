//! コプロセッサへのコマンド送信。
//!
//! コマンドは1ワード目に種類と命令、2ワード目に引数の数、以降に引数を置く。
//! 同時に処理中にできるコマンドは1つだけで、[`CommandChannel`]のロックで排他する。

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::clock::{poll_until, Clock};
use crate::config::Timeouts;
use crate::error::{Error, Phase, Result};
use crate::hw::{self, msgstate, Dpram};

/// コマンドの引数の最大数。
pub const MAX_ARGS: usize = 18;

/// 応答の最大ワード数。
pub const MAX_REPLY: usize = hw::COM_BUFF_WORDS;

/// 古いインターフェースロックを必要とするファームウェアの最終バージョン。
const LEGACY_APP_VERSION: u32 = 0x261F;

/// コマンドの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    /// コマンド無し。
    NoCom = 0x00,
    /// デコーダーのPID。
    PidFilter = 0x01,
    /// MPEGデコーダー。
    MpegDecoder = 0x02,
    /// OSD。
    Osd = 0x03,
    /// ビットマップ。
    Bmp = 0x04,
    /// アナログ出力。
    Encoder = 0x05,
    /// 音声DAC。
    AudioDac = 0x06,
    /// 状態の問い合わせ。
    Request = 0x07,
    /// システム。
    System = 0x08,
    /// 録画と再生。
    RecPlay = 0x09,
    /// CIインターフェース。
    CommonIf = 0x0A,
    /// ハードウェアPIDフィルター。
    PidFilterHw = 0x0B,
    /// PES。
    Pes = 0x0C,
    /// TS。
    Ts = 0x0D,
    /// 映像。
    Video = 0x0E,
    /// 音声。
    Audio = 0x0F,
    /// CIリンク層。
    CiLl = 0x10,
    /// その他。
    Misc = 0x80,
}

impl CommandType {
    /// 汎用キューで処理される種類かどうかを返す。
    ///
    /// それ以外はOSDキューで処理される。
    #[inline]
    fn uses_general_queue(self) -> bool {
        matches!(
            self,
            CommandType::PidFilter
                | CommandType::Encoder
                | CommandType::RecPlay
                | CommandType::MpegDecoder
        )
    }
}

/// [`CommandType::PidFilter`]と[`CommandType::PidFilterHw`]の命令。
pub mod pid_op {
    /// デコーダーの全PIDを一度に設定する。
    pub const MULTI_PID: u8 = 0;
    /// ハードウェアフィルターを追加する。
    pub const ADD_PID_FILTER: u8 = 7;
    /// ハードウェアフィルターを削除する。
    pub const DEL_PID_FILTER: u8 = 8;
    /// PSIを読み直す。
    pub const SCAN: u8 = 9;
}

/// [`CommandType::RecPlay`]の命令。
pub mod rec_play_op {
    /// 録画を開始する。
    pub const RECORD: u8 = 0;
    /// 録画・再生を停止する。
    pub const STOP: u8 = 1;
    /// 再生を開始する。
    pub const PLAY: u8 = 2;
    /// 再生を一時停止する。
    pub const PAUSE: u8 = 3;
    /// 一時停止した再生を再開する。
    pub const CONTINUE: u8 = 7;
}

/// [`CommandType::Request`]の命令。
pub mod request_op {
    /// ファームウェアのバージョンを問い合わせる。
    pub const REQ_VERSION: u8 = 6;
}

/// [`CommandType::Encoder`]の命令。
pub mod encoder_op {
    /// アナログ出力のモードを設定する。
    pub const LOAD_VID_CODE: u8 = 2;
}

/// [`CommandType::Osd`]の命令。
pub mod osd_op {
    /// 文字列を描画する。
    pub const DTEXT: u8 = 8;
    /// ビットマップを読み込む。
    pub const LOAD_BMP: u8 = 15;
}

/// 録画・再生コマンドの引数に渡すストリーム形式。
pub mod rp_format {
    /// 音声PES。
    pub const AUDIO_PES: u16 = 1;
    /// 映像PES。
    pub const VIDEO_PES: u16 = 4;
    /// 音声と映像のPES。
    pub const AV_PES: u16 = 5;
}

/// コプロセッサへ送るコマンド。
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    /// コマンドの種類。
    pub ty: CommandType,
    /// 命令。
    pub opcode: u8,
    /// 引数。
    pub args: ArrayVec<u16, MAX_ARGS>,
}

impl Command {
    /// `Command`を生成する。
    ///
    /// 引数が多すぎる場合は`Error::InvalidArgument`を返す。
    pub fn new(ty: CommandType, opcode: u8, args: &[u16]) -> Result<Command> {
        let args = args
            .try_into()
            .map_err(|_| Error::InvalidArgument("too many command arguments"))?;
        Ok(Command { ty, opcode, args })
    }

    /// コマンドレジスタに書き込むワードを返す。
    #[inline]
    pub fn opcode_word(&self) -> u16 {
        (self.ty as u16) << 8 | self.opcode as u16
    }

    #[inline]
    fn is_osd_text(&self) -> bool {
        self.ty == CommandType::Osd && self.opcode == osd_op::DTEXT
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Command({:04X}", self.opcode_word())?;
        for arg in &self.args {
            write!(f, " {:04X}", arg)?;
        }
        f.write_str(")")
    }
}

/// コプロセッサのファームウェアのバージョン。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareVersion {
    /// ファームウェア。
    pub firmware: u32,
    /// リアルタイムOS。
    pub rtsl: u32,
    /// 映像デコーダー。
    pub video: u32,
    /// アプリケーション。
    pub app: u32,
}

impl FirmwareVersion {
    fn from_words(words: &[u16]) -> FirmwareVersion {
        let dword = |i: usize| (words[i] as u32) << 16 | words[i + 1] as u32;
        FirmwareVersion {
            firmware: dword(0),
            rtsl: dword(2),
            video: dword(4),
            app: dword(6),
        }
    }
}

/// [`CommandChannel::lock`]で得られるガード。
pub type ChannelGuard<'a> = ReentrantMutexGuard<'a, ()>;

/// コプロセッサとの間で1つずつコマンドをやり取りする。
///
/// ロックは再入可能であり、[`lock`](CommandChannel::lock)で保持したまま同じスレッドから
/// コマンドを送ることができる。
pub struct CommandChannel {
    dpram: Arc<dyn Dpram>,
    clock: Arc<dyn Clock>,
    timeouts: Timeouts,
    lock: ReentrantMutex<()>,
    errors: AtomicU32,
    app: AtomicU32,
}

impl CommandChannel {
    /// `CommandChannel`を生成する。
    pub fn new(dpram: Arc<dyn Dpram>, clock: Arc<dyn Clock>, timeouts: Timeouts) -> CommandChannel {
        CommandChannel {
            dpram,
            clock,
            timeouts,
            lock: ReentrantMutex::new(()),
            errors: AtomicU32::new(0),
            app: AtomicU32::new(0),
        }
    }

    /// 他の呼び出し元を締め出す。
    #[inline]
    pub fn lock(&self) -> ChannelGuard {
        self.lock.lock()
    }

    #[inline]
    fn is_legacy(&self) -> bool {
        self.app.load(Ordering::Relaxed) & 0xFFFF <= LEGACY_APP_VERSION
    }

    fn poll(&self, addr: u32, timeout: std::time::Duration, phase: Phase, mask: u16) -> Result<()> {
        poll_until(
            &*self.clock,
            timeout,
            self.timeouts.poll_interval,
            phase,
            || self.dpram.read_word(addr) & mask == 0,
        )
    }

    /// `cmd`を送る。
    pub fn send(&self, cmd: &Command) -> Result<()> {
        let _guard = self.lock();
        self.send_locked(cmd)
    }

    fn send_locked(&self, cmd: &Command) -> Result<()> {
        log::trace!("send {:?}", cmd);

        if let Err(e) = self.poll(hw::COMMAND, self.timeouts.command_idle, Phase::CommandIdle, !0) {
            log::warn!("{:?}: {}", cmd, e);
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let legacy = self.is_legacy();
        if legacy {
            self.dpram.write_word(hw::COM_IF_LOCK, 0xFFFF);
        }
        let result = self.issue(cmd, legacy);
        if legacy {
            self.dpram.write_word(hw::COM_IF_LOCK, 0x0000);
        }
        result
    }

    fn issue(&self, cmd: &Command, legacy: bool) -> Result<()> {
        if let Err(e) = self.poll(hw::HANDSHAKE_REG, self.timeouts.handshake, Phase::Handshake, !0) {
            log::warn!("{:?}: {}", cmd, e);
            return Err(e);
        }
        if cmd.is_osd_text() {
            let result = self.poll(
                hw::MSGSTATE,
                self.timeouts.osd_queue,
                Phase::OsdQueue,
                msgstate::OSDQ_FULL,
            );
            if let Err(e) = result {
                log::warn!("{:?}: {}", cmd, e);
                return Err(e);
            }
        }

        for (i, &arg) in cmd.args.iter().enumerate().rev() {
            self.dpram.write_word(hw::COM_BUFF + 4 + 2 * i as u32, arg);
        }
        self.dpram.write_word(hw::COM_BUFF + 2, cmd.args.len() as u16);
        self.dpram.write_word(hw::COMMAND, cmd.opcode_word());

        if legacy {
            return Ok(());
        }

        let overflow = if cmd.ty.uses_general_queue() {
            msgstate::GPMQ_OVER
        } else {
            msgstate::OSDQ_OVER
        };
        if self.dpram.read_word(hw::MSGSTATE) & overflow != 0 {
            log::warn!("{:?}: queue overflow", cmd);
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ResourceExhausted);
        }
        Ok(())
    }

    /// `cmd`を送り、完了を待って`reply_len`ワードの応答を返す。
    pub fn request(&self, cmd: &Command, reply_len: usize) -> Result<ArrayVec<u16, MAX_REPLY>> {
        if reply_len > MAX_REPLY {
            return Err(Error::InvalidArgument("reply too long"));
        }

        let _guard = self.lock();
        self.send_locked(cmd)?;

        if let Err(e) = self.poll(hw::COMMAND, self.timeouts.command_idle, Phase::Completion, !0) {
            log::warn!("{:?}: {}", cmd, e);
            return Err(e);
        }
        if let Err(e) = self.poll(hw::HANDSHAKE_REG, self.timeouts.handshake, Phase::Handshake, !0) {
            log::warn!("{:?}: {}", cmd, e);
            return Err(e);
        }

        let reply = (0..reply_len)
            .map(|i| self.dpram.read_word(hw::COM_BUFF + 2 * i as u32))
            .collect();
        log::trace!("reply {:04X?}", reply);
        Ok(reply)
    }

    /// 種類と命令、引数からコマンドを組み立てて送る。
    pub fn send_command(&self, ty: CommandType, opcode: u8, args: &[u16]) -> Result<()> {
        self.send(&Command::new(ty, opcode, args)?)
    }

    /// 種類と命令、引数からコマンドを組み立てて送り、応答を返す。
    pub fn request_words(
        &self,
        ty: CommandType,
        opcode: u8,
        args: &[u16],
        reply_len: usize,
    ) -> Result<ArrayVec<u16, MAX_REPLY>> {
        self.request(&Command::new(ty, opcode, args)?, reply_len)
    }

    /// ファームウェアのバージョンを問い合わせる。
    ///
    /// 以降のコマンドは得られたバージョンに合わせた手順で送られる。
    pub fn firmware_version(&self) -> Result<FirmwareVersion> {
        let words = self.request_words(CommandType::Request, request_op::REQ_VERSION, &[], 16)?;
        let version = FirmwareVersion::from_words(&words);
        self.set_firmware_app(version.app);
        log::info!(
            "firmware {:08X}, rtsl {:08X}, vid {:08X}, app {:08X}",
            version.firmware,
            version.rtsl,
            version.video,
            version.app
        );
        Ok(version)
    }

    /// コプロセッサのメインループの周回数を読み込む。
    pub fn loop_counter(&self) -> u16 {
        let _guard = self.lock();
        self.dpram.read_word(hw::STATUS_LOOPS)
    }

    /// コマンドの失敗回数を返す。
    #[inline]
    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    /// コマンドの失敗回数を0に戻す。
    #[inline]
    pub fn reset_errors(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }

    /// ファームウェアのアプリケーションバージョンを設定する。
    #[inline]
    pub fn set_firmware_app(&self, app: u32) {
        self.app.store(app, Ordering::Relaxed);
    }
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("errors", &self.error_count())
            .field("app", &self.app.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
