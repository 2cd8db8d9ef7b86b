//! PIDごとのフィードとハードウェアフィルターの管理。
//!
//! フィードは受信するPIDと受け取り方（TS、セクション、PES）を表し、
//! 受け取ったデータはフィードごとの[`FeedSink`]へ渡される。
//! コプロセッサ搭載カードではセクションとTSのフィードにハードウェアフィルターを割り当て、
//! 映像・音声などデコーダー向けのフィードはデコーダーのPIDとして設定する。

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use mpegts::packet::{PACKET_SIZE, SYNC_BYTE};
use mpegts::section::FILTER_SIZE;
use mpegts::{clear_video_length, Packet, PesToTs, Pid, PidTable, SectionAssembler, SectionFilter, TsToPes};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use smallvec::SmallVec;

use crate::command::{pid_op, CommandChannel, CommandType};
use crate::config::{CardClass, CardConfig};
use crate::error::{Error, Result};
use crate::playback::{Playback, StreamClass};
use crate::stream::{Mode, StreamStateMachine};

/// セクションを受け取るハードウェアフィルターのモード。
const SECTION_MODE: u16 = 0x0004;
/// TSを受け取るハードウェアフィルターのモード。
const PIPE_MODE: u16 = 0xB96A;
/// PESフィードで組み立てるPESの最大長。
const MAX_PES: usize = 0xFFFF + 6;

/// デコーダーのPIDが無効であることを示すビット。
const PID_INACTIVE: u16 = 0x8000;
/// MultiPIDで値を変更しないことを示すPID。
const PID_UNCHANGED: u16 = 0xFFFF;

/// フィードの識別子。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedHandle(pub(crate) usize);

/// PESの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PesType {
    /// 音声。
    Audio,
    /// 映像。
    Video,
    /// 文字多重放送。
    Teletext,
    /// 字幕。
    Subtitle,
    /// PCR。
    Pcr,
    /// その他。
    Other,
}

impl PesType {
    /// デコーダーのPID表における位置を返す。
    #[inline]
    fn decoder_index(self) -> Option<usize> {
        match self {
            PesType::Audio => Some(0),
            PesType::Video => Some(1),
            PesType::Teletext => Some(2),
            PesType::Subtitle => Some(3),
            PesType::Pcr => Some(4),
            PesType::Other => None,
        }
    }

    /// 再生・録画するストリームの種類を返す。
    #[inline]
    pub fn class(self) -> Option<StreamClass> {
        match self {
            PesType::Audio => Some(StreamClass::Audio),
            PesType::Video => Some(StreamClass::Video),
            _ => None,
        }
    }
}

/// TSフィードの受け取り方。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TsFlags {
    /// TSパケットを受け取る。
    pub full_packet: bool,
    /// TSヘッダを除いたペイロードだけを受け取る。
    pub payload_only: bool,
    /// デコーダーへ渡す。
    pub decode: bool,
}

/// フィードの種類。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedKind {
    /// TSパケットを受け取る。
    Ts {
        /// 受け取り方。
        flags: TsFlags,
        /// PESの種類。
        pes_type: PesType,
    },
    /// フィルターに一致するセクションを受け取る。
    Section {
        /// セクションフィルター。
        filter: SectionFilter,
    },
    /// 組み立てたPESを受け取る。
    Pes {
        /// PESの種類。
        pes_type: PesType,
    },
}

impl FeedKind {
    /// デコーダー向けのフィードであれば、デコーダーのPID表における位置を返す。
    fn decoder_index(&self) -> Option<usize> {
        match self {
            FeedKind::Ts { flags, pes_type } if flags.decode => pes_type.decoder_index(),
            _ => None,
        }
    }
}

/// TSの入力元。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// チューナー。
    Frontend,
    /// ホストから書き込まれたTS。
    Memory,
}

/// フィードに届いたデータを受け取る。
///
/// 各メソッドはフィードの表をロックした状態で呼ばれるため、
/// 中から[`DemuxEngine`]を操作してはならない。
pub trait FeedSink: Send {
    /// TSパケット、またはペイロードを受け取る。
    fn on_ts(&mut self, feed: FeedHandle, data: &[u8]);

    /// セクションを受け取る。
    fn on_section(&mut self, feed: FeedHandle, section: &[u8]);

    /// PESを受け取る。
    fn on_pes(&mut self, feed: FeedHandle, pes: &[u8]) {
        let _ = (feed, pes);
    }
}

/// デコーダーに設定するPID。
///
/// 最上位ビットが立った値は変更しないことを表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderPids {
    /// 映像のPID。
    pub video: u16,
    /// 音声のPID。
    pub audio: u16,
    /// 文字多重放送のPID。
    pub teletext: u16,
    /// 字幕のPID。
    pub subtitle: u16,
    /// PCRのPID。
    pub pcr: u16,
}

impl DecoderPids {
    /// どのPIDも変更しない。
    pub const UNCHANGED: DecoderPids = DecoderPids {
        video: PID_UNCHANGED,
        audio: PID_UNCHANGED,
        teletext: PID_UNCHANGED,
        subtitle: PID_UNCHANGED,
        pcr: PID_UNCHANGED,
    };

    /// PESの種類の順に並べたPIDから生成する。
    fn from_indexed(pids: [u16; 5]) -> DecoderPids {
        let [audio, video, teletext, subtitle, pcr] = pids;
        DecoderPids {
            video,
            audio,
            teletext,
            subtitle,
            pcr,
        }
    }

    fn to_indexed(self) -> [u16; 5] {
        [self.audio, self.video, self.teletext, self.subtitle, self.pcr]
    }
}

struct PidState {
    /// デコーダー向けフィードのPID。フィードが無ければ`PID_INACTIVE`が立つ。
    requested: [u16; 5],
    /// 最後にコプロセッサへ設定したPID。
    applied: [u16; 5],
    decoders: [Option<FeedHandle>; 5],
}

impl PidState {
    fn new() -> PidState {
        PidState {
            requested: [PID_UNCHANGED; 5],
            applied: [0; 5],
            decoders: [None; 5],
        }
    }

    #[inline]
    fn is_active(&self, index: usize) -> bool {
        self.requested[index] & PID_INACTIVE == 0
    }
}

/// [`DemuxEngine::lock_pids`]で得られるガード。
pub struct PidGuard<'a>(#[allow(dead_code)] ReentrantMutexGuard<'a, RefCell<PidState>>);

/// 受け取ったデータをフィードの形式へ整えるための状態。
enum Framing {
    Raw,
    PesToTs(PesToTs),
    Sections(SectionAssembler),
    Pes(TsToPes),
}

impl Framing {
    fn new(pid: Pid, kind: &FeedKind) -> Framing {
        match kind {
            FeedKind::Ts { flags, .. } if flags.full_packet && !flags.payload_only => {
                Framing::PesToTs(PesToTs::new(pid))
            }
            FeedKind::Ts { .. } => Framing::Raw,
            FeedKind::Section { .. } => Framing::Sections(SectionAssembler::new()),
            FeedKind::Pes { .. } => Framing::Pes(TsToPes::new(MAX_PES)),
        }
    }

    fn reset(&mut self) {
        match self {
            Framing::Raw => {}
            Framing::PesToTs(p2t) => p2t.reset(),
            Framing::Sections(assembler) => assembler.reset(),
            Framing::Pes(t2p) => t2p.reset(),
        }
    }
}

struct Feed {
    pid: Pid,
    kind: FeedKind,
    sink: Box<dyn FeedSink>,
    hw: Option<u16>,
    framing: Framing,
}

struct FeedTable {
    slots: Vec<Option<Feed>>,
    by_pid: PidTable<SmallVec<[FeedHandle; 2]>>,
    by_hw: FxHashMap<u16, FeedHandle>,
}

impl FeedTable {
    fn new(capacity: usize) -> FeedTable {
        FeedTable {
            slots: (0..capacity).map(|_| None).collect(),
            by_pid: PidTable::default(),
            by_hw: FxHashMap::default(),
        }
    }

    fn get_mut(&mut self, handle: FeedHandle) -> Option<&mut Feed> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    fn insert(&mut self, feed: Feed) -> Result<FeedHandle> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted)?;
        let handle = FeedHandle(index);
        self.by_pid[feed.pid].push(handle);
        self.slots[index] = Some(feed);
        Ok(handle)
    }

    fn remove(&mut self, handle: FeedHandle) -> Option<Feed> {
        let feed = self.slots.get_mut(handle.0)?.take()?;
        self.by_pid[feed.pid].retain(|h| *h != handle);
        if let Some(hw) = feed.hw {
            self.by_hw.remove(&hw);
        }
        Some(feed)
    }

    fn set_hw(&mut self, handle: FeedHandle, hw: Option<u16>) {
        if let Some(feed) = self.slots.get_mut(handle.0).and_then(Option::as_mut) {
            if let Some(old) = std::mem::replace(&mut feed.hw, hw) {
                self.by_hw.remove(&old);
            }
        }
        if let Some(hw) = hw {
            self.by_hw.insert(hw, handle);
        }
    }

    /// `packet`がデコーダーへ渡るPESの種類を返す。
    fn decoder_class(&self, packet: &Packet) -> Option<StreamClass> {
        self.by_pid[packet.pid()].iter().find_map(|handle| {
            match &self.slots[handle.0].as_ref()?.kind {
                FeedKind::Ts { flags, pes_type } if flags.decode => pes_type.class(),
                _ => None,
            }
        })
    }

    /// パケットを各フィードへ渡す。
    ///
    /// 再生バッファに空きが無い場合や閉じられている場合は、どのフィードにも渡さずにエラーを返す。
    fn filter_packet(&mut self, packet: &Packet, memory: bool, playback: &Playback) -> Result<()> {
        if memory {
            if let Some(class) = self.decoder_class(packet) {
                playback.reserve(true)?;
                match playback.write_ts_to_decoder(class, packet) {
                    Err(Error::WouldBlock) => log::debug!("{:?}: decoder data dropped", class),
                    result => result?,
                }
            }
        }

        let FeedTable { slots, by_pid, .. } = self;
        for &handle in by_pid[packet.pid()].iter() {
            let Some(Feed {
                kind,
                sink,
                hw,
                framing,
                ..
            }) = slots[handle.0].as_mut()
            else {
                continue;
            };

            match kind {
                FeedKind::Ts { flags, .. } => {
                    if flags.full_packet {
                        if !flags.payload_only {
                            sink.on_ts(handle, &packet.0);
                        } else if let Some(payload) = packet.payload() {
                            sink.on_ts(handle, payload);
                        }
                    }
                }
                FeedKind::Section { filter } => {
                    if hw.is_some() {
                        continue;
                    }
                    if let Framing::Sections(assembler) = framing {
                        assembler.push(packet, |section| {
                            if filter.matches_masked(section) {
                                sink.on_section(handle, section);
                            }
                        });
                    }
                }
                FeedKind::Pes { .. } => {
                    if let Framing::Pes(t2p) = framing {
                        t2p.write_packet(packet, |pes| sink.on_pes(handle, pes));
                    }
                }
            }
        }
        Ok(())
    }
}

/// フィードの表とデコーダーのPIDを管理する。
///
/// フィードの開始・停止はPID変更用のロックを取ってから行われ、
/// コプロセッサへのコマンドはその内側で送られる。
/// 割り込み側から呼ばれる[`on_filtered`](DemuxEngine::on_filtered)などは
/// フィードの表だけをロックする。
pub struct DemuxEngine {
    channel: Arc<CommandChannel>,
    stream: Arc<StreamStateMachine>,
    playback: Arc<Playback>,
    hw_filters: bool,
    capacity: usize,
    pids_off: bool,
    pid_lock_patience: Duration,
    pids: ReentrantMutex<RefCell<PidState>>,
    memory_source: AtomicBool,
    feeds: Mutex<FeedTable>,
}

impl DemuxEngine {
    /// `DemuxEngine`を生成する。
    pub fn new(
        config: &CardConfig,
        channel: Arc<CommandChannel>,
        stream: Arc<StreamStateMachine>,
        playback: Arc<Playback>,
    ) -> DemuxEngine {
        let capacity = config.class.filter_slots();
        DemuxEngine {
            channel,
            stream,
            playback,
            hw_filters: config.class == CardClass::Coprocessor,
            capacity,
            pids_off: config.pids_off,
            pid_lock_patience: config.timeouts.pid_lock,
            pids: ReentrantMutex::new(RefCell::new(PidState::new())),
            memory_source: AtomicBool::new(false),
            feeds: Mutex::new(FeedTable::new(capacity)),
        }
    }

    fn pid_state(&self, patience: Duration) -> Result<ReentrantMutexGuard<RefCell<PidState>>> {
        self.pids.try_lock_for(patience).ok_or_else(|| {
            log::warn!("pid lock busy");
            Error::Busy
        })
    }

    /// PID変更用のロックを最大`patience`だけ待って取得する。
    pub fn lock_pids(&self, patience: Duration) -> Result<PidGuard> {
        self.pid_state(patience).map(PidGuard)
    }

    /// TSの入力元を返す。
    #[inline]
    pub fn source(&self) -> Source {
        if self.memory_source.load(Ordering::Acquire) {
            Source::Memory
        } else {
            Source::Frontend
        }
    }

    /// TSの入力元を切り替える。
    pub fn set_source(&self, source: Source) -> Result<()> {
        let _pids = self.pid_state(self.pid_lock_patience)?;
        log::debug!("demux source: {:?}", source);
        self.memory_source
            .store(source == Source::Memory, Ordering::Release);
        Ok(())
    }

    /// 最後にコプロセッサへ設定したデコーダーのPIDを返す。
    pub fn applied_pids(&self) -> DecoderPids {
        let pids = self.pids.lock();
        let applied = pids.borrow().applied;
        DecoderPids::from_indexed(applied)
    }

    /// 開始しているフィードの数を返す。
    pub fn feed_count(&self) -> usize {
        self.feeds.lock().slots.iter().filter(|f| f.is_some()).count()
    }

    /// `feed`に割り当てられたハードウェアフィルターを返す。
    pub fn hw_handle(&self, feed: FeedHandle) -> Option<u16> {
        self.feeds.lock().get_mut(feed).and_then(|f| f.hw)
    }

    /// デコーダーのPIDを変更する。
    ///
    /// いずれかが0x1FFFの場合はすべてのPIDを0にする。
    pub fn change_pids(&self, pids: DecoderPids) -> Result<()> {
        let state = self.pid_state(self.pid_lock_patience)?;
        if !self.hw_filters {
            return Ok(());
        }

        let mut indexed = pids.to_indexed();
        if indexed.contains(&Pid::NULL.get()) {
            indexed = [0; 5];
        }
        {
            let mut state = state.borrow_mut();
            for (applied, &pid) in state.applied.iter_mut().zip(&indexed) {
                if pid & PID_INACTIVE == 0 {
                    *applied = pid;
                }
            }
        }

        let [audio, video, teletext, subtitle, pcr] = indexed;
        self.channel.send_command(
            CommandType::PidFilter,
            pid_op::MULTI_PID,
            &[pcr, video, audio, teletext, subtitle, 0],
        )
    }

    /// `pid`のフィードを開始する。
    pub fn start_feed(&self, pid: Pid, kind: FeedKind, sink: Box<dyn FeedSink>) -> Result<FeedHandle> {
        let state = self.pid_state(self.pid_lock_patience)?;
        let decoder = kind.decoder_index();
        if let Some(index) = decoder {
            if state.borrow().decoders[index].is_some() {
                return Err(Error::Busy);
            }
        }

        let handle = self.feeds.lock().insert(Feed {
            pid,
            framing: Framing::new(pid, &kind),
            kind: kind.clone(),
            sink,
            hw: None,
        })?;
        if let Some(index) = decoder {
            let mut state = state.borrow_mut();
            state.decoders[index] = Some(handle);
            state.requested[index] = pid.get();
        }
        log::debug!("start feed {:?}: {:?} {:?}", handle, pid, kind);

        if let Err(e) = self.activate(handle, pid, &kind) {
            log::debug!("start feed {:?} failed: {}", handle, e);
            if let Some(index) = decoder {
                let mut state = state.borrow_mut();
                state.decoders[index] = None;
                state.requested[index] |= PID_INACTIVE;
            }
            self.feeds.lock().remove(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn activate(&self, handle: FeedHandle, pid: Pid, kind: &FeedKind) -> Result<()> {
        let memory = self.source() == Source::Memory;
        match kind {
            FeedKind::Ts { flags, .. } => match kind.decoder_index() {
                Some(index) if memory => {
                    let state = self.pids.lock();
                    let both = {
                        let state = state.borrow();
                        state.is_active(0) && state.is_active(1)
                    };
                    if index < 2 && both && self.stream.playing().is_none() {
                        self.playback.flush();
                        self.stream.start_play(Mode::AV)?;
                    }
                    Ok(())
                }
                Some(index) => self.start_decoder_pid(handle, pid, index, flags),
                None if flags.full_packet && !memory => {
                    self.install_hw_filter(handle, pid, PIPE_MODE, &[0; FILTER_SIZE])
                }
                None => Ok(()),
            },
            FeedKind::Section { filter } if !memory => {
                self.install_hw_filter(handle, pid, SECTION_MODE, &filter.to_words())
            }
            FeedKind::Section { .. } | FeedKind::Pes { .. } => Ok(()),
        }
    }

    fn start_decoder_pid(&self, handle: FeedHandle, pid: Pid, index: usize, flags: &TsFlags) -> Result<()> {
        let mut npids = [PID_UNCHANGED; 5];
        {
            let state = self.pids.lock();
            let state = state.borrow();
            npids[index] = if state.is_active(index) {
                state.requested[index]
            } else {
                0
            };
        }

        // 文字多重放送はデコーダーではなくハードウェアフィルターで受け取る
        if index == 2 && npids[index] != 0 && flags.full_packet {
            npids[index] = 0;
            self.change_pids(DecoderPids::from_indexed(npids))?;
            return self.install_hw_filter(handle, pid, PIPE_MODE, &[0; FILTER_SIZE]);
        }

        if index <= 2 || index == 4 {
            self.change_pids(DecoderPids::from_indexed(npids))?;
        }
        if flags.full_packet && self.hw_filters {
            match index {
                0 => self.stream.start_record(StreamClass::Audio, handle, pid)?,
                1 => self.stream.start_record(StreamClass::Video, handle, pid)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn install_hw_filter(&self, handle: FeedHandle, pid: Pid, mode: u16, words: &[u16; FILTER_SIZE]) -> Result<()> {
        if !self.hw_filters {
            return Ok(());
        }

        let mut args = [0; 2 + FILTER_SIZE];
        args[0] = pid.get();
        args[1] = mode;
        args[2..].copy_from_slice(words);
        let reply = self.channel.request_words(
            CommandType::PidFilterHw,
            pid_op::ADD_PID_FILTER,
            &args,
            1,
        )?;

        let hw = reply.first().copied().unwrap_or(u16::MAX);
        if hw as usize >= self.capacity {
            log::warn!("no free hardware filter for {:?} (got {:#06X})", pid, hw);
            return Err(Error::ResourceExhausted);
        }
        log::trace!("hw filter {} for {:?}", hw, pid);
        self.feeds.lock().set_hw(handle, Some(hw));
        Ok(())
    }

    /// ハードウェアフィルターを解放する。
    ///
    /// コプロセッサの応答に関わらず、ローカルの割り当ては解除される。
    fn remove_hw_filter(&self, handle: FeedHandle, hw: u16) -> Result<()> {
        self.feeds.lock().set_hw(handle, None);
        if hw as usize >= self.capacity {
            return Err(Error::Malformed("filter handle out of range"));
        }

        let reply = self.channel.request_words(
            CommandType::PidFilterHw,
            pid_op::DEL_PID_FILTER,
            &[hw],
            2,
        )?;
        if reply.get(1) != Some(&hw) {
            log::debug!("filter {}: coprocessor released {:?}", hw, reply.get(1));
        }
        Ok(())
    }

    /// フィードを停止する。
    ///
    /// コプロセッサとのやり取りに失敗した場合もフィードは解放される。
    pub fn stop_feed(&self, handle: FeedHandle) -> Result<()> {
        let state = self.pid_state(self.pid_lock_patience)?;
        let (kind, hw) = match self.feeds.lock().get_mut(handle) {
            Some(feed) => (feed.kind.clone(), feed.hw),
            None => return Err(Error::InvalidArgument("unknown feed")),
        };
        log::debug!("stop feed {:?}", handle);

        let result = match kind.decoder_index() {
            Some(index) => {
                {
                    let mut state = state.borrow_mut();
                    state.requested[index] |= PID_INACTIVE;
                    state.decoders[index] = None;
                }
                self.stop_decoder_pid(handle, index, hw)
            }
            None => match hw {
                Some(hw) => self.remove_hw_filter(handle, hw),
                None => Ok(()),
            },
        };

        self.feeds.lock().remove(handle);
        result
    }

    fn stop_decoder_pid(&self, handle: FeedHandle, index: usize, hw: Option<u16>) -> Result<()> {
        match index {
            0 => self.stream.stop(Mode::AUDIO)?,
            1 => self.stream.stop(Mode::VIDEO)?,
            _ => {}
        }

        let mut npids = [PID_UNCHANGED; 5];
        match index {
            2 => {
                if let Some(hw) = hw {
                    self.remove_hw_filter(handle, hw)?;
                }
                npids[2] = 0;
            }
            0 | 1 | 4 => {
                if !self.pids_off {
                    return Ok(());
                }
                npids[index] = 0;
            }
            _ => {}
        }
        self.change_pids(DecoderPids::from_indexed(npids))
    }

    /// セクションフィードのフィルターを変更する。
    ///
    /// ハードウェアフィルターが割り当てられていれば設定し直す。
    pub fn set_section_filter(&self, handle: FeedHandle, filter: SectionFilter) -> Result<()> {
        let _state = self.pid_state(self.pid_lock_patience)?;
        let (pid, hw) = {
            let mut feeds = self.feeds.lock();
            let Some(feed) = feeds.get_mut(handle) else {
                return Err(Error::InvalidArgument("unknown feed"));
            };
            let FeedKind::Section { filter: current } = &mut feed.kind else {
                return Err(Error::InvalidArgument("not a section feed"));
            };
            *current = filter.clone();
            feed.framing.reset();
            (feed.pid, feed.hw)
        };

        if let Some(hw) = hw {
            self.remove_hw_filter(handle, hw)?;
            self.install_hw_filter(handle, pid, SECTION_MODE, &filter.to_words())?;
        }
        Ok(())
    }

    /// コプロセッサを再起動した後、すべてのフィードと再生を再開する。
    pub fn restart_feeds(&self) -> Result<()> {
        let _state = self.pid_state(self.pid_lock_patience)?;
        let mode = self.stream.forget();

        let active: Vec<_> = {
            let mut feeds = self.feeds.lock();
            feeds.by_hw.clear();
            feeds
                .slots
                .iter_mut()
                .enumerate()
                .filter_map(|(i, slot)| {
                    let feed = slot.as_mut()?;
                    feed.hw = None;
                    feed.framing.reset();
                    Some((FeedHandle(i), feed.pid, feed.kind.clone()))
                })
                .collect()
        };
        log::debug!("restarting {} feeds", active.len());

        let mut result = Ok(());
        for (handle, pid, kind) in active {
            if let Err(e) = self.activate(handle, pid, &kind) {
                log::warn!("restart feed {:?} failed: {}", handle, e);
                result = result.and(Err(e));
            }
        }

        if !mode.is_none() && self.stream.playing().is_none() {
            self.stream.start_play(mode)?;
        }
        result
    }

    /// ハードウェアフィルターで受け取ったデータをフィードへ渡す。
    pub fn on_filtered(&self, hw: u16, data: &[u8]) {
        if self.source() == Source::Memory {
            return;
        }

        let mut feeds = self.feeds.lock();
        let Some(handle) = feeds.by_hw.get(&hw).copied() else {
            log::debug!("data for unknown filter {}", hw);
            return;
        };
        let Some(Feed {
            kind, sink, framing, ..
        }) = feeds.get_mut(handle)
        else {
            return;
        };

        match kind {
            FeedKind::Section { filter } => {
                if filter.matches(data) {
                    sink.on_section(handle, data);
                }
            }
            FeedKind::Ts { flags, .. } => {
                if !flags.full_packet {
                    return;
                }
                if flags.payload_only {
                    sink.on_ts(handle, data);
                } else if let Framing::PesToTs(p2t) = framing {
                    p2t.write(data, |packet| sink.on_ts(handle, &packet.0));
                }
            }
            FeedKind::Pes { .. } => sink.on_pes(handle, data),
        }
    }

    /// 録画しているPESを、録画を開始したフィードへ渡す。
    pub fn on_pes_record(&self, class: StreamClass, data: &mut [u8]) {
        let Some(handle) = self.stream.recording_feed(class) else {
            log::debug!("{:?} record data while not recording", class);
            return;
        };

        let mut feeds = self.feeds.lock();
        let Some(Feed { kind, sink, .. }) = feeds.get_mut(handle) else {
            return;
        };
        let FeedKind::Ts { flags, .. } = kind else {
            return;
        };
        if !flags.full_packet {
            return;
        }

        clear_video_length(data);
        if flags.payload_only {
            sink.on_ts(handle, data);
        } else {
            self.stream.with_recorder(class, |recorder| {
                recorder
                    .packetizer
                    .write(data, true, |packet| sink.on_ts(handle, &packet.0))
            });
        }
    }

    /// TSパケットの列をソフトウェアで分離し、各フィードへ渡す。
    ///
    /// 処理したバイト数を返す。同期バイトがずれている場合は次の同期バイトまで読み飛ばし、
    /// 188バイトに満たない末尾は処理しない。
    ///
    /// 入力元がメモリでデコーダー向けのフィードがある場合、再生バッファに空きができるまで
    /// フィードの表をロックせずに待機する。`nonblock`の場合は待機せず、
    /// 1パケットも処理できなければ`Error::WouldBlock`を返す。
    pub fn sw_filter_packets(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        let memory = self.source() == Source::Memory;

        let mut rest = data;
        while rest.len() >= PACKET_SIZE {
            if rest[0] != SYNC_BYTE {
                match memchr::memchr(SYNC_BYTE, &rest[1..]) {
                    Some(pos) => {
                        log::debug!("ts resync: skipped {} bytes", pos + 1);
                        rest = &rest[pos + 1..];
                        continue;
                    }
                    None => break,
                }
            }

            let Some(packet) = Packet::from_bytes(rest) else {
                break;
            };
            if let Err(e) = self.filter_one(&packet, memory, nonblock) {
                let done = data.len() - rest.len();
                if done == 0 {
                    return Err(e);
                }
                log::trace!("ts input stopped after {} bytes: {}", done, e);
                return Ok(done);
            }
            rest = &rest[PACKET_SIZE..];
        }
        Ok(data.len() - rest.len())
    }

    fn filter_one(&self, packet: &Packet, memory: bool, nonblock: bool) -> Result<()> {
        loop {
            let result = self.feeds.lock().filter_packet(packet, memory, &self.playback);
            match result {
                Err(Error::WouldBlock) if !nonblock => self.playback.reserve(false)?,
                result => return result,
            }
        }
    }
}

impl fmt::Debug for DemuxEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DemuxEngine")
            .field("source", &self.source())
            .field("feeds", &self.feed_count())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
