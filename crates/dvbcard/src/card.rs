//! カード全体をまとめる。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bitmap::BitmapQueue;
use crate::boot;
use crate::ci::CiInterface;
use crate::clock::Clock;
use crate::command::{osd_op, ChannelGuard, CommandChannel, CommandType, FirmwareVersion};
use crate::config::{CardClass, CardConfig};
use crate::demux::{DemuxEngine, PidGuard, Source};
use crate::error::{Error, Result};
use crate::hw::{Bridge, Dpram};
use crate::ir::{DeviceId, IrRegistry};
use crate::mailbox::{Devices, MailboxDispatcher};
use crate::playback::{Playback, StreamClass};
use crate::router::StreamRouter;
use crate::stream::{StreamGuard, StreamStateMachine};

/// [`Card::attach`]の戻り値。
#[derive(Debug)]
pub struct Attached {
    /// カード。
    pub card: Arc<Card>,
    /// 割り込みの文脈から呼ぶ処理。
    pub dispatcher: MailboxDispatcher,
    /// 割り込みから届いたデータを処理する。
    pub router: StreamRouter,
}

/// PID変更用のロック、状態遷移のロック、コマンドチャンネルのロックをこの順にすべて保持する。
///
/// 保持している間、他のスレッドはフィードの変更もコマンドの送信もできない。
pub(crate) struct Exclusive<'a> {
    _pids: PidGuard<'a>,
    _stream: StreamGuard<'a>,
    _channel: ChannelGuard<'a>,
}

/// 1枚のカード。
///
/// 部品はすべて`Arc`で共有され、各種アクセサから直接操作できる。
pub struct Card {
    config: CardConfig,
    dpram: Arc<dyn Dpram>,
    bridge: Arc<dyn Bridge>,
    clock: Arc<dyn Clock>,
    firmware: Box<[u8]>,

    channel: Arc<CommandChannel>,
    stream: Arc<StreamStateMachine>,
    playback: Arc<Playback>,
    demux: Arc<DemuxEngine>,
    ci: Arc<CiInterface>,
    bitmap: Arc<BitmapQueue>,
    ir: Arc<IrRegistry>,

    started: AtomicBool,
    ready: AtomicBool,
    recovering: AtomicBool,
}

impl Card {
    /// カードを構成する。コプロセッサはまだ起動しない。
    ///
    /// `ir_device`はこのカードのリモコン受信コードを配送する先。
    pub fn attach(
        config: CardConfig,
        dpram: Arc<dyn Dpram>,
        bridge: Arc<dyn Bridge>,
        clock: Arc<dyn Clock>,
        firmware: &[u8],
        ir_device: DeviceId,
    ) -> Attached {
        let channel = Arc::new(CommandChannel::new(dpram.clone(), clock.clone(), config.timeouts));
        let playback = Arc::new(Playback::new(&config));
        let stream = Arc::new(StreamStateMachine::new(
            channel.clone(),
            playback.clone(),
            config.video_mode,
        ));
        let demux = Arc::new(DemuxEngine::new(
            &config,
            channel.clone(),
            stream.clone(),
            playback.clone(),
        ));
        let ci = Arc::new(CiInterface::new(config.ci_buffer_size));
        let bitmap = Arc::new(BitmapQueue::new());
        let ir = Arc::new(IrRegistry::new());

        let (tx, rx) = crossbeam_channel::bounded(config.delivery_queue);
        let dispatcher = MailboxDispatcher::new(
            Devices {
                dpram: dpram.clone(),
                bridge: bridge.clone(),
                stream: stream.clone(),
                playback: playback.clone(),
                ci: ci.clone(),
                bitmap: bitmap.clone(),
                ir: ir.clone(),
            },
            ir_device,
            config.playback_chunk,
            tx,
        );
        let router = StreamRouter::new(rx, demux.clone(), ci.clone());

        let card = Arc::new(Card {
            config,
            dpram,
            bridge,
            clock,
            firmware: firmware.into(),
            channel,
            stream,
            playback,
            demux,
            ci,
            bitmap,
            ir,
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
        });
        Attached {
            card,
            dispatcher,
            router,
        }
    }

    fn boot(&self) -> Result<Option<FirmwareVersion>> {
        if self.config.class == CardClass::Software {
            return Ok(None);
        }

        boot::load_firmware(
            &*self.dpram,
            &*self.bridge,
            &*self.clock,
            &self.config.timeouts,
            &self.firmware,
        )?;
        self.channel.firmware_version().map(Some)
    }

    /// コプロセッサを起動し、ファームウェアのバージョンを返す。
    ///
    /// コプロセッサを持たないカードでは`None`を返す。
    pub fn start(&self) -> Result<Option<FirmwareVersion>> {
        let _channel = self.channel.lock();
        let version = self.boot()?;
        self.started.store(true, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        Ok(version)
    }

    /// コプロセッサが動作しているかどうかを返す。
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// 起動してから閉じるまでの間であれば`true`を返す。
    ///
    /// 復旧に失敗して[`is_ready`](Card::is_ready)が`false`の間も`true`のままとなる。
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// 監視と復旧のためにすべてのロックを取得する。
    pub(crate) fn lock_exclusive(&self) -> Result<Exclusive> {
        let pids = self.demux.lock_pids(self.config.timeouts.pid_lock)?;
        Ok(Exclusive {
            _pids: pids,
            _stream: self.stream.lock(),
            _channel: self.channel.lock(),
        })
    }

    /// コプロセッサを起動し直し、フィードと再生を再開する。
    ///
    /// 既に復旧中であれば`Error::Busy`を返す。
    pub(crate) fn recover(&self) -> Result<()> {
        if self.recovering.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        let result = self.recover_locked();
        self.recovering.store(false, Ordering::Release);
        if let Err(e) = result {
            log::error!("coprocessor recovery failed: {}", e);
        }
        result
    }

    fn recover_locked(&self) -> Result<()> {
        let _locked = self.lock_exclusive()?;

        log::info!("restarting coprocessor");
        self.ready.store(false, Ordering::Release);
        self.boot()?;
        self.ready.store(true, Ordering::Release);
        self.demux.restart_feeds()
    }

    /// 映像・音声のPESを書き込む。
    pub fn write_av(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        self.playback.write(StreamClass::Video, data, nonblock)
    }

    /// 音声のPESを書き込む。
    pub fn write_audio(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        self.playback.write(StreamClass::Audio, data, nonblock)
    }

    /// 入力元がメモリの場合にTSを書き込み、フィードへ振り分ける。
    ///
    /// 処理したバイト数を返す。デコーダー向けのフィードがあれば再生バッファの空きを待ち、
    /// `nonblock`の場合は待たずに`Error::WouldBlock`を返す。
    pub fn write_ts(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        if self.demux.source() != Source::Memory {
            return Err(Error::InvalidArgument("ts input requires memory source"));
        }
        if self.playback.is_closed() {
            return Err(Error::Closed);
        }
        self.demux.sw_filter_packets(data, nonblock)
    }

    /// OSDビットマップを読み込ませ、転送の完了を待つ。
    pub fn load_bitmap(&self, format: u16, width: u16, height: u16, data: &[u8]) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        self.bitmap.stage(data)?;
        if let Err(e) = self
            .channel
            .send_command(CommandType::Osd, osd_op::LOAD_BMP, &[format, width, height])
        {
            self.bitmap.discard();
            return Err(e);
        }
        self.bitmap.wait_loaded(self.config.timeouts.bitmap)
    }

    /// 再生バッファとCIのキューを閉じ、待機中の呼び出しをすべて起こす。
    pub fn close(&self) {
        log::debug!("closing card");
        self.started.store(false, Ordering::Release);
        self.ready.store(false, Ordering::Release);
        self.playback.close();
        self.ci.close();
        self.bitmap.cancel();
    }

    /// 設定を返す。
    #[inline]
    pub fn config(&self) -> &CardConfig {
        &self.config
    }

    /// コマンドチャンネルを返す。
    #[inline]
    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    /// デマルチプレクサーを返す。
    #[inline]
    pub fn demux(&self) -> &Arc<DemuxEngine> {
        &self.demux
    }

    /// 録画・再生の状態を返す。
    #[inline]
    pub fn stream(&self) -> &Arc<StreamStateMachine> {
        &self.stream
    }

    /// 再生バッファを返す。
    #[inline]
    pub fn playback(&self) -> &Arc<Playback> {
        &self.playback
    }

    /// CIのキューを返す。
    #[inline]
    pub fn ci(&self) -> &Arc<CiInterface> {
        &self.ci
    }

    /// リモコン受信コードの配送先を返す。
    #[inline]
    pub fn ir(&self) -> &Arc<IrRegistry> {
        &self.ir
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Card")
            .field("class", &self.config.class)
            .field("ready", &self.is_ready())
            .field("stream", &self.stream)
            .field("demux", &self.demux)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{FeedHandle, FeedKind, FeedSink, TsFlags};
    use crate::hw::{self, IrqLine};
    use crate::sim;
    use crate::stream::Mode;
    use assert_matches::assert_matches;
    use hex_literal::hex;
    use mpegts::{p_to_t, Pid, SectionFilter};
    use parking_lot::Mutex;
    use std::time::Duration;

    const SECTION: [u8; 12] = hex!("42 F0 09 00 01 C1 00 00 AA BB CC DD");
    const PLAY: u16 = 0x0902;
    const LOAD_BMP: u16 = 0x030F;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<Vec<u8>>>>);

    impl FeedSink for Collect {
        fn on_ts(&mut self, _: FeedHandle, data: &[u8]) {
            self.0.lock().push(data.to_vec());
        }

        fn on_section(&mut self, _: FeedHandle, section: &[u8]) {
            self.0.lock().push(section.to_vec());
        }
    }

    fn section_feed() -> FeedKind {
        FeedKind::Section {
            filter: SectionFilter::table_id(0x42),
        }
    }

    #[test]
    fn test_start() {
        let (attached, coproc, bridge) = sim::card(CardConfig::DEFAULT);
        let card = attached.card;
        assert!(!card.is_ready());
        assert_eq!(card.load_bitmap(0, 1, 1, &[0]), Err(Error::NotReady));

        let version = card.start().unwrap().unwrap();
        assert_eq!(version.app, 0x2623);
        assert!(card.is_ready());
        assert_eq!(coproc.boots(), 1);
        assert_eq!(coproc.image(), sim::FIRMWARE);
        assert!(bridge.irq_enabled(IrqLine::Mailbox));
    }

    #[test]
    fn test_start_software_card() {
        let (attached, coproc, _) = sim::card(CardConfig::new(CardClass::Software));
        assert_eq!(attached.card.start(), Ok(None));
        assert!(attached.card.is_ready());
        assert_eq!(coproc.boots(), 0);
    }

    #[test]
    fn test_section_through_mailbox() {
        let (attached, coproc, bridge) = sim::card(CardConfig::DEFAULT);
        let Attached {
            card,
            mut dispatcher,
            mut router,
        } = attached;
        card.start().unwrap();

        let sink = Collect::default();
        let feed = card
            .demux()
            .start_feed(Pid::new(0x0012), section_feed(), Box::new(sink.clone()))
            .unwrap();
        let hw = card.demux().hw_handle(feed).unwrap();

        coproc.put_bytes(hw::DPRAM_BASE + 0x0200, &SECTION);
        coproc.raise(0x0001 | hw << 8, SECTION.len() as u16, 0x0200);
        dispatcher.on_mailbox_irq();
        let data = bridge.complete_read().unwrap();
        dispatcher.on_transfer_done(&data);

        assert_eq!(router.drain(), 1);
        assert_eq!(*sink.0.lock(), vec![SECTION.to_vec()]);
    }

    #[test]
    fn test_recover() {
        let (attached, coproc, _) = sim::card(CardConfig::DEFAULT);
        let card = attached.card;
        card.start().unwrap();

        card.demux()
            .start_feed(Pid::new(0x0012), section_feed(), Box::new(Collect::default()))
            .unwrap();
        card.stream().start_play(Mode::AUDIO).unwrap();
        coproc.clear_commands();

        card.recover().unwrap();
        assert_eq!(coproc.boots(), 2);
        assert!(card.is_ready());
        assert_eq!(coproc.filters().len(), 1);
        assert_eq!(coproc.commands_of(PLAY), vec![vec![1, 0]]);
        assert_eq!(card.stream().playing(), Mode::AUDIO);
    }

    #[test]
    fn test_recover_reentry() {
        let (attached, coproc, _) = sim::card(CardConfig::DEFAULT);
        let card = attached.card;
        card.start().unwrap();

        card.recovering.store(true, Ordering::SeqCst);
        assert_eq!(card.recover(), Err(Error::Busy));
        assert_eq!(coproc.boots(), 1);

        card.recovering.store(false, Ordering::SeqCst);
        coproc.set_boot_stall(true);
        assert_matches!(card.recover(), Err(Error::Timeout(_)));
        assert!(!card.is_ready());
        assert!(card.is_started());
        assert!(!card.recovering.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_ts() {
        let (attached, _, _) = sim::card(CardConfig::DEFAULT);
        let card = attached.card;
        card.start().unwrap();

        let sink = Collect::default();
        card.demux()
            .start_feed(
                Pid::new(0x0100),
                FeedKind::Ts {
                    flags: TsFlags {
                        full_packet: true,
                        ..TsFlags::default()
                    },
                    pes_type: crate::demux::PesType::Other,
                },
                Box::new(sink.clone()),
            )
            .unwrap();

        let mut packets = Vec::new();
        let mut counter = 0;
        let pes = hex!("00 00 01 BD 00 03 80 00 00");
        p_to_t(&pes, Pid::new(0x0100), &mut counter, |p| packets.extend_from_slice(&p.0));

        assert_matches!(card.write_ts(&packets, false), Err(Error::InvalidArgument(_)));
        card.demux().set_source(Source::Memory).unwrap();
        assert_eq!(card.write_ts(&packets, false), Ok(packets.len()));
        assert_eq!(sink.0.lock().len(), 1);

        // 188バイトに満たない末尾は処理しない
        assert_eq!(card.write_ts(&packets[..100], false), Ok(0));

        card.close();
        assert_eq!(card.write_ts(&packets, false), Err(Error::Closed));
    }

    fn audio_decoder() -> FeedKind {
        FeedKind::Ts {
            flags: TsFlags {
                decode: true,
                ..TsFlags::default()
            },
            pes_type: crate::demux::PesType::Audio,
        }
    }

    /// 再生が始まらないまま音声を書き込み続けるためのTS。
    fn audio_ts(count: usize) -> Vec<u8> {
        let mut ts = Vec::new();
        let mut counter = 0;
        for _ in 0..count {
            let mut pes = hex!("00 00 01 C0 07 D3 80 00 00").to_vec();
            pes.resize(2000 + 9, 0x55);
            p_to_t(&pes, Pid::new(0x0110), &mut counter, |p| ts.extend_from_slice(&p.0));
        }
        ts
    }

    #[test]
    fn test_write_ts_nonblock() {
        let (attached, _, _) = sim::card(CardConfig::DEFAULT);
        let card = attached.card;
        card.start().unwrap();
        card.demux().set_source(Source::Memory).unwrap();
        let feed = card
            .demux()
            .start_feed(Pid::new(0x0110), audio_decoder(), Box::new(Collect::default()))
            .unwrap();
        assert_eq!(card.stream().playing(), Mode::NONE);

        let ts = audio_ts(72);
        let done = card.write_ts(&ts, true).unwrap();
        assert!(done > 0 && done < ts.len());
        assert_eq!(done % 188, 0);
        assert_eq!(card.write_ts(&ts[done..], true), Err(Error::WouldBlock));

        card.demux().stop_feed(feed).unwrap();
        assert_eq!(card.demux().feed_count(), 0);
    }

    #[test]
    fn test_write_ts_blocked_writer() {
        let (attached, _, _) = sim::card(CardConfig::DEFAULT);
        let card = attached.card;
        card.start().unwrap();
        card.demux().set_source(Source::Memory).unwrap();
        let feed = card
            .demux()
            .start_feed(Pid::new(0x0110), audio_decoder(), Box::new(Collect::default()))
            .unwrap();

        let ts = audio_ts(72);
        let len = ts.len();
        let writer = {
            let card = card.clone();
            std::thread::spawn(move || card.write_ts(&ts, false))
        };
        let threshold = card.config().playback_free_threshold;
        for _ in 0..1000 {
            if card.playback().audio_buffer().free() < threshold {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(card.playback().audio_buffer().free() < threshold);

        // 書き込みが待機している間もフィードを操作できる
        card.demux().stop_feed(feed).unwrap();
        card.demux()
            .start_feed(Pid::new(0x0012), section_feed(), Box::new(Collect::default()))
            .unwrap();

        card.close();
        let done = writer.join().unwrap().unwrap();
        assert!(done > 0 && done < len);
        assert_eq!(done % 188, 0);
    }

    #[test]
    fn test_write_av_and_close() {
        let (attached, _, _) = sim::card(CardConfig::DEFAULT);
        let card = attached.card;
        let pes = hex!("00 00 01 C0 00 05 80 00 00 11 22");
        assert_eq!(card.write_audio(&pes, true), Ok(pes.len()));
        assert_eq!(card.playback().audio_buffer().avail(), pes.len());

        let video = hex!("00 00 01 E0 00 05 80 00 00 33 44");
        assert_eq!(card.write_av(&video, true), Ok(video.len()));
        assert_eq!(card.playback().av_buffer().avail(), video.len());

        card.close();
        assert!(!card.is_ready());
        assert!(!card.is_started());
        let mut buf = [0; 16];
        assert_eq!(card.ci().read_message(&mut buf, false), Err(Error::Closed));
    }

    #[test]
    fn test_load_bitmap() {
        let (attached, coproc, bridge) = sim::card(CardConfig::DEFAULT);
        let Attached {
            card,
            mut dispatcher,
            ..
        } = attached;
        card.start().unwrap();

        let data: Vec<u8> = (0..5000).map(|i| i as u8).collect();
        let c = card.clone();
        let d = data.clone();
        let handle = std::thread::spawn(move || c.load_bitmap(1, 100, 50, &d));

        for _ in 0..1000 {
            if !coproc.commands_of(LOAD_BMP).is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(coproc.commands_of(LOAD_BMP), vec![vec![1, 100, 50]]);

        let mut sent = Vec::new();
        while sent.len() < data.len() {
            coproc.raise(0x0007, 4096, 0);
            dispatcher.on_mailbox_irq();
            for transfer in bridge.take_transfers() {
                if let sim::Transfer::Write { data, .. } = transfer {
                    sent.extend(data);
                }
            }
            dispatcher.on_transfer_done(&[]);
        }
        coproc.raise(0x0007, 0, 0);
        dispatcher.on_mailbox_irq();

        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(sent, data);
    }

    #[test]
    fn test_load_bitmap_timeout() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = CardConfig::DEFAULT;
        config.timeouts.bitmap = Duration::from_millis(10);
        let (attached, _, _) = sim::card(config);
        let card = attached.card;
        card.start().unwrap();

        assert_eq!(
            card.load_bitmap(1, 1, 1, &[0; 4]),
            Err(Error::Timeout(crate::error::Phase::Bitmap))
        );
        // 次の転送は受け付けられる
        assert_eq!(
            card.load_bitmap(1, 1, 1, &[0; 4]),
            Err(Error::Timeout(crate::error::Phase::Bitmap))
        );
    }
}
