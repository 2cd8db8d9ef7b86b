//! 再生・録画の状態遷移。

use std::cell::RefCell;
use std::fmt;
use std::ops;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use mpegts::{Pid, RecordPacketizer};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::command::{encoder_op, rec_play_op, rp_format, CommandChannel, CommandType};
use crate::demux::FeedHandle;
use crate::error::{Error, Result};
use crate::playback::{Playback, StreamClass};

/// 再生・録画しているストリームの組み合わせ。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mode(u8);

impl Mode {
    /// 何もしていない。
    pub const NONE: Mode = Mode(0);
    /// 音声のみ。
    pub const AUDIO: Mode = Mode(1);
    /// 映像のみ。
    pub const VIDEO: Mode = Mode(2);
    /// 音声と映像。
    pub const AV: Mode = Mode(3);

    /// `class`だけを含む`Mode`を返す。
    #[inline]
    pub fn of(class: StreamClass) -> Mode {
        match class {
            StreamClass::Audio => Mode::AUDIO,
            StreamClass::Video => Mode::VIDEO,
        }
    }

    /// 何も含まないかどうかを返す。
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// `other`と共通するストリームがあるかどうかを返す。
    #[inline]
    pub fn intersects(self, other: Mode) -> bool {
        self.0 & other.0 != 0
    }

    /// `class`を含むかどうかを返す。
    #[inline]
    pub fn contains(self, class: StreamClass) -> bool {
        self.intersects(Mode::of(class))
    }

    /// コマンドに渡すストリーム形式を返す。
    fn format(self) -> Option<u16> {
        match self {
            Mode::AUDIO => Some(rp_format::AUDIO_PES),
            Mode::VIDEO => Some(rp_format::VIDEO_PES),
            Mode::AV => Some(rp_format::AV_PES),
            _ => None,
        }
    }
}

impl ops::BitOr for Mode {
    type Output = Mode;

    #[inline]
    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

impl ops::Sub for Mode {
    type Output = Mode;

    #[inline]
    fn sub(self, rhs: Mode) -> Mode {
        Mode(self.0 & !rhs.0)
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Mode::NONE => "None",
            Mode::AUDIO => "Audio",
            Mode::VIDEO => "Video",
            _ => "AV",
        })
    }
}

/// 録画しているストリームの出力先。
#[derive(Debug)]
pub(crate) struct Recorder {
    pub feed: FeedHandle,
    pub packetizer: RecordPacketizer,
}

#[derive(Debug, Default)]
struct State {
    playing: Mode,
    recording: Mode,
}

/// [`StreamStateMachine::lock`]で得られるガード。
pub struct StreamGuard<'a>(#[allow(dead_code)] ReentrantMutexGuard<'a, RefCell<State>>);

/// 再生・録画の状態を管理し、状態に合わせたコマンドをコプロセッサへ送る。
///
/// コプロセッサには音声・映像を個別に追加するコマンドが無いため、
/// 遷移のたびに停止してから組み合わせ全体を指定し直す。
/// 同じカードで再生と録画を同時に行うことはできない。
pub struct StreamStateMachine {
    channel: Arc<CommandChannel>,
    playback: Arc<Playback>,
    video_mode: u16,
    state: ReentrantMutex<RefCell<State>>,
    playing: AtomicU8,
    recording: AtomicU8,
    video_frozen: AtomicBool,
    recorders: Mutex<[Option<Recorder>; 2]>,
}

impl StreamStateMachine {
    /// `StreamStateMachine`を生成する。
    ///
    /// `video_mode`は再生を終えたときに設定し直すアナログ出力のモードである。
    pub fn new(channel: Arc<CommandChannel>, playback: Arc<Playback>, video_mode: u16) -> StreamStateMachine {
        StreamStateMachine {
            channel,
            playback,
            video_mode,
            state: ReentrantMutex::new(RefCell::new(State::default())),
            playing: AtomicU8::new(0),
            recording: AtomicU8::new(0),
            video_frozen: AtomicBool::new(false),
            recorders: Mutex::new([None, None]),
        }
    }

    /// 状態遷移を締め出す。
    #[inline]
    pub fn lock(&self) -> StreamGuard {
        StreamGuard(self.state.lock())
    }

    /// 再生しているストリームを返す。
    #[inline]
    pub fn playing(&self) -> Mode {
        Mode(self.playing.load(Ordering::Acquire))
    }

    /// 録画しているストリームを返す。
    #[inline]
    pub fn recording(&self) -> Mode {
        Mode(self.recording.load(Ordering::Acquire))
    }

    /// 映像が一時停止しているかどうかを返す。
    #[inline]
    pub fn is_video_frozen(&self) -> bool {
        self.video_frozen.load(Ordering::Acquire)
    }

    fn publish(&self, state: &State) {
        self.playing.store(state.playing.0, Ordering::Release);
        self.recording.store(state.recording.0, Ordering::Release);
    }

    fn rec_play(&self, opcode: u8, format: Option<u16>) -> Result<()> {
        match format {
            Some(format) => self
                .channel
                .send_command(CommandType::RecPlay, opcode, &[format, 0]),
            None => self.channel.send_command(CommandType::RecPlay, opcode, &[]),
        }
    }

    /// `mode`の再生を開始する。
    ///
    /// 録画中か、既に`mode`のストリームを再生している場合は`Error::Busy`を返す。
    pub fn start_play(&self, mode: Mode) -> Result<()> {
        if mode.is_none() {
            return Err(Error::InvalidArgument("empty play mode"));
        }

        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.recording.is_none() || state.playing.intersects(mode) {
            return Err(Error::Busy);
        }

        self.rec_play(rec_play_op::STOP, None)?;
        if state.playing.is_none() {
            self.playback.reset_repackers();
        }
        state.playing = state.playing | mode;
        self.publish(&state);
        log::debug!("play {:?}", state.playing);

        self.rec_play(rec_play_op::PLAY, state.playing.format())
    }

    /// `class`の録画を開始し、録画データを`feed`へ`pid`のTSとして渡すようにする。
    ///
    /// 再生中か、既に`class`を録画している場合は`Error::Busy`を返す。
    pub fn start_record(&self, class: StreamClass, feed: FeedHandle, pid: Pid) -> Result<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.playing.is_none() || state.recording.contains(class) {
            return Err(Error::Busy);
        }

        self.rec_play(rec_play_op::STOP, None)?;
        state.recording = state.recording | Mode::of(class);
        self.publish(&state);
        self.recorders.lock()[class.index()] = Some(Recorder {
            feed,
            packetizer: RecordPacketizer::new(pid),
        });
        log::debug!("record {:?}", state.recording);

        self.rec_play(rec_play_op::RECORD, state.recording.format())
    }

    /// `mode`の再生か録画を停止する。
    ///
    /// 残ったストリームの再生・録画は指定し直される。
    /// 再生がすべて止まった場合はアナログ出力のモードを設定し直す。
    pub fn stop(&self, mode: Mode) -> Result<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.playing.intersects(mode) && !state.recording.intersects(mode) {
            return Ok(());
        }

        self.rec_play(rec_play_op::STOP, None)?;
        if !state.playing.is_none() {
            state.playing = state.playing - mode;
            self.publish(&state);
            log::debug!("play {:?}", state.playing);

            match state.playing.format() {
                Some(format) => self.rec_play(rec_play_op::PLAY, Some(format)),
                None => self.channel.send_command(
                    CommandType::Encoder,
                    encoder_op::LOAD_VID_CODE,
                    &[self.video_mode],
                ),
            }
        } else {
            state.recording = state.recording - mode;
            self.publish(&state);
            {
                let mut recorders = self.recorders.lock();
                for class in [StreamClass::Audio, StreamClass::Video] {
                    if !state.recording.contains(class) {
                        recorders[class.index()] = None;
                    }
                }
            }
            log::debug!("record {:?}", state.recording);

            match state.recording.format() {
                Some(format) => self.rec_play(rec_play_op::RECORD, Some(format)),
                None => Ok(()),
            }
        }
    }

    /// 映像を一時停止する。
    pub fn freeze(&self) -> Result<()> {
        let _guard = self.state.lock();
        self.video_frozen.store(true, Ordering::Release);
        if self.playing().contains(StreamClass::Video) {
            self.rec_play(rec_play_op::PAUSE, None)?;
        }
        Ok(())
    }

    /// 一時停止した映像を再開する。
    pub fn resume(&self) -> Result<()> {
        let _guard = self.state.lock();
        if self.playing().contains(StreamClass::Video) {
            self.rec_play(rec_play_op::CONTINUE, None)?;
        }
        self.video_frozen.store(false, Ordering::Release);
        Ok(())
    }

    /// コマンドを送らずに状態を初期化し、直前に再生していたストリームを返す。
    ///
    /// コプロセッサを再起動した後に状態を復元するために使う。
    pub fn forget(&self) -> Mode {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let playing = state.playing;
        *state = State::default();
        self.publish(&state);
        *self.recorders.lock() = [None, None];
        playing
    }

    /// `class`の録画データの出力先を返す。
    pub(crate) fn recording_feed(&self, class: StreamClass) -> Option<FeedHandle> {
        self.recorders.lock()[class.index()]
            .as_ref()
            .map(|r| r.feed)
    }

    /// `class`の録画データの出力先に対して`f`を呼ぶ。
    pub(crate) fn with_recorder<R>(
        &self,
        class: StreamClass,
        f: impl FnOnce(&mut Recorder) -> R,
    ) -> Option<R> {
        self.recorders.lock()[class.index()].as_mut().map(f)
    }
}

impl fmt::Debug for StreamStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamStateMachine")
            .field("playing", &self.playing())
            .field("recording", &self.recording())
            .field("video_frozen", &self.is_video_frozen())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardConfig;
    use crate::sim::{FakeClock, FakeCoprocessor};

    const STOP: u16 = 0x0901;
    const PLAY: u16 = 0x0902;
    const RECORD: u16 = 0x0900;

    fn machine() -> (Arc<FakeCoprocessor>, StreamStateMachine) {
        let coproc = Arc::new(FakeCoprocessor::new());
        let config = CardConfig {
            video_mode: 1,
            ..CardConfig::DEFAULT
        };
        let channel = Arc::new(CommandChannel::new(
            coproc.clone(),
            Arc::new(FakeClock::new()),
            config.timeouts,
        ));
        channel.set_firmware_app(0x2623);
        let playback = Arc::new(Playback::new(&config));
        (coproc, StreamStateMachine::new(channel, playback, config.video_mode))
    }

    fn words(coproc: &FakeCoprocessor) -> Vec<(u16, Vec<u16>)> {
        coproc
            .commands()
            .into_iter()
            .map(|c| (c.word, c.args))
            .collect()
    }

    #[test]
    fn test_play_audio_video_stop_audio() {
        let (coproc, machine) = machine();
        machine.start_play(Mode::AUDIO).unwrap();
        machine.start_play(Mode::VIDEO).unwrap();
        assert_eq!(machine.playing(), Mode::AV);

        machine.stop(Mode::AUDIO).unwrap();
        assert_eq!(machine.playing(), Mode::VIDEO);

        assert_eq!(
            words(&coproc),
            vec![
                (STOP, vec![]),
                (PLAY, vec![rp_format::AUDIO_PES, 0]),
                (STOP, vec![]),
                (PLAY, vec![rp_format::AV_PES, 0]),
                (STOP, vec![]),
                (PLAY, vec![rp_format::VIDEO_PES, 0]),
            ]
        );
    }

    #[test]
    fn test_stop_all_restores_video_mode() {
        let (coproc, machine) = machine();
        machine.start_play(Mode::AV).unwrap();
        coproc.clear_commands();

        machine.stop(Mode::AV).unwrap();
        assert_eq!(machine.playing(), Mode::NONE);
        assert_eq!(words(&coproc), vec![(STOP, vec![]), (0x0502, vec![1])]);

        // 何もしていなければコマンドを送らない
        coproc.clear_commands();
        machine.stop(Mode::AV).unwrap();
        assert!(coproc.commands().is_empty());
    }

    #[test]
    fn test_busy() {
        let (_coproc, machine) = machine();
        machine.start_play(Mode::AUDIO).unwrap();
        assert_eq!(machine.start_play(Mode::AUDIO), Err(Error::Busy));
        assert_eq!(
            machine.start_record(StreamClass::Video, FeedHandle(0), Pid::new(0x100)),
            Err(Error::Busy)
        );

        machine.stop(Mode::AUDIO).unwrap();
        machine
            .start_record(StreamClass::Video, FeedHandle(0), Pid::new(0x100))
            .unwrap();
        assert_eq!(machine.start_play(Mode::AUDIO), Err(Error::Busy));
        assert_eq!(
            machine.start_record(StreamClass::Video, FeedHandle(1), Pid::new(0x100)),
            Err(Error::Busy)
        );
    }

    #[test]
    fn test_record() {
        let (coproc, machine) = machine();
        machine
            .start_record(StreamClass::Audio, FeedHandle(3), Pid::new(0x110))
            .unwrap();
        machine
            .start_record(StreamClass::Video, FeedHandle(4), Pid::new(0x100))
            .unwrap();
        assert_eq!(machine.recording(), Mode::AV);
        assert_eq!(machine.recording_feed(StreamClass::Video), Some(FeedHandle(4)));

        machine.stop(Mode::VIDEO).unwrap();
        assert_eq!(machine.recording(), Mode::AUDIO);
        assert_eq!(machine.recording_feed(StreamClass::Video), None);
        assert_eq!(
            machine.with_recorder(StreamClass::Audio, |r| r.packetizer.counter()),
            Some(0)
        );

        let records = coproc.commands_of(RECORD);
        assert_eq!(
            records,
            vec![
                vec![rp_format::AUDIO_PES, 0],
                vec![rp_format::AV_PES, 0],
                vec![rp_format::AUDIO_PES, 0],
            ]
        );

        machine.stop(Mode::AUDIO).unwrap();
        assert_eq!(machine.recording(), Mode::NONE);
        assert_eq!(coproc.commands_of(RECORD).len(), 3);
    }

    #[test]
    fn test_freeze_resume() {
        let (coproc, machine) = machine();
        machine.freeze().unwrap();
        assert!(machine.is_video_frozen());
        assert!(coproc.commands().is_empty());
        machine.resume().unwrap();
        assert!(!machine.is_video_frozen());

        machine.start_play(Mode::VIDEO).unwrap();
        machine.freeze().unwrap();
        machine.resume().unwrap();
        assert_eq!(coproc.commands_of(0x0903).len(), 1);
        assert_eq!(coproc.commands_of(0x0907).len(), 1);
    }

    #[test]
    fn test_forget() {
        let (coproc, machine) = machine();
        machine.start_play(Mode::AV).unwrap();
        coproc.clear_commands();
        assert_eq!(machine.forget(), Mode::AV);
        assert_eq!(machine.playing(), Mode::NONE);
        assert!(coproc.commands().is_empty());
    }

    #[test]
    fn test_timeout_keeps_state() {
        let (coproc, machine) = machine();
        coproc.set_handshake_busy(true);
        assert!(machine.start_play(Mode::AUDIO).is_err());
        assert_eq!(machine.playing(), Mode::NONE);
    }
}
