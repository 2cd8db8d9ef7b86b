//! コプロセッサからの通知の受け付け。
//!
//! コプロセッサはメッセージを用意するとメールボックス割り込みを上げる。
//! 本文を伴うメッセージはブリッジの転送で読み込み、転送完了の割り込みで処理する。
//! 再生データなどの要求には転送で書き込んで応える。
//! どの経路でも最後にメールボックスを1度だけ空にする。

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};

use crate::bitmap::BitmapQueue;
use crate::ci::{CiInterface, MAX_MESSAGE};
use crate::hw::{self, Bridge, Dpram, IrqLine};
use crate::ir::{decode_ir_code, DeviceId, IrRegistry};
use crate::playback::{Playback, StreamClass};
use crate::stream::StreamStateMachine;

/// 本文を転送するセクション系メッセージの最大長。
const MAX_FILTERED: usize = 4096;
/// デバッグ文字列の最大長。
const MAX_DEBUG: usize = 0xFF;

/// 再生要求で音声を受け付けることを示すビット。
const PLAY_AUDIO: u16 = 0x0100;
/// 再生要求で映像・音声を受け付けることを示すビット。
const PLAY_AV: u16 = 0x0200;

/// メッセージの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// フィルターに一致したセクション。
    Section,
    /// IPMPE。
    Ipmpe,
    /// デバッグ文字列。
    DebugText,
    /// CIの状態変化。
    CommonInterface,
    /// 再生データの要求。
    PlaybackRequest,
    /// ビットマップの要求。
    BitmapLoad,
    /// リモコン受信コード。
    IrCommand,
    /// フィルターを通したTS。
    Piping,
    /// CIから届いたメッセージ。
    CiGet,
    /// CIへ送るメッセージの要求。
    CiPut,
    /// 映像の状態変化。
    VideoEvent,
    /// 録画したPES。
    PesRecord,
    /// PES再生の通知。
    PesPlay,
    /// 録画したTS。
    TsRecord,
    /// TS再生の通知。
    TsPlay,
}

impl MessageKind {
    /// 割り込み状態レジスタの下位バイトからメッセージの種類を得る。
    pub fn from_code(code: u8) -> Option<MessageKind> {
        Some(match code {
            0x01 => MessageKind::Section,
            0x02 => MessageKind::Ipmpe,
            0x04 => MessageKind::DebugText,
            0x05 => MessageKind::CommonInterface,
            0x06 => MessageKind::PlaybackRequest,
            0x07 => MessageKind::BitmapLoad,
            0x08 => MessageKind::IrCommand,
            0x09 => MessageKind::Piping,
            0x0B => MessageKind::CiGet,
            0x0C => MessageKind::CiPut,
            0x0D => MessageKind::VideoEvent,
            0x10 => MessageKind::PesRecord,
            0x11 => MessageKind::PesPlay,
            0x12 => MessageKind::TsRecord,
            0x13 => MessageKind::TsPlay,
            _ => return None,
        })
    }
}

/// コプロセッサから届いたメッセージ。
///
/// 本文は割り込み処理の間だけ有効。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundMessage<'a> {
    /// 種類。
    pub kind: MessageKind,
    /// フィルターなどの識別子。
    pub handle: u16,
    /// コプロセッサが通知した長さ。
    pub length: u16,
    /// 本文。
    pub payload: &'a [u8],
}

/// 割り込み処理の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// 通知を待っている。
    Idle,
    /// 通知の種類を読んでいる。
    Classifying,
    /// メッセージを処理している。
    Dispatching,
    /// 転送の完了を待っている。
    AwaitingTransfer,
}

/// 割り込み処理からストリーム処理へ渡すデータ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// 録画したTS。
    TsRecord(Vec<u8>),
    /// 録画したPES。
    PesRecord {
        /// ストリームの種類。
        class: StreamClass,
        /// PES。
        data: Vec<u8>,
    },
    /// ハードウェアフィルターを通ったデータ。
    Filtered {
        /// メッセージの種類。
        kind: MessageKind,
        /// ハードウェアフィルターの識別子。
        handle: u16,
        /// 本文。
        data: Vec<u8>,
    },
    /// CIから届いたメッセージ。
    CiGet(Vec<u8>),
}

/// 割り込み処理から参照するカードの部品。
#[derive(Clone)]
pub(crate) struct Devices {
    pub dpram: Arc<dyn Dpram>,
    pub bridge: Arc<dyn Bridge>,
    pub stream: Arc<StreamStateMachine>,
    pub playback: Arc<Playback>,
    pub ci: Arc<CiInterface>,
    pub bitmap: Arc<BitmapQueue>,
    pub ir: Arc<IrRegistry>,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: MessageKind,
    handle: u16,
    length: u16,
    write: bool,
}

enum Action {
    Ack,
    Read { addr: u32, len: usize },
    Write { addr: u32, len: usize },
    EmptyReply,
}

/// メールボックス割り込みと転送完了割り込みを処理する。
///
/// 割り込みの文脈から1つずつ呼ばれることを想定しており、
/// 待機するロックは取らない。ストリーム処理へ渡すデータは有限のチャンネルへ送り、
/// 満杯の場合は捨てる。
pub struct MailboxDispatcher {
    devices: Devices,
    ir_device: DeviceId,
    chunk: usize,
    deliveries: Sender<Delivery>,
    state: DispatchState,
    pending: Option<Pending>,
    scratch: Box<[u8]>,
}

impl MailboxDispatcher {
    pub(crate) fn new(
        devices: Devices,
        ir_device: DeviceId,
        chunk: usize,
        deliveries: Sender<Delivery>,
    ) -> MailboxDispatcher {
        MailboxDispatcher {
            devices,
            ir_device,
            chunk: chunk.min(hw::MAX_TRANSFER),
            deliveries,
            state: DispatchState::Idle,
            pending: None,
            scratch: vec![0; hw::MAX_TRANSFER].into_boxed_slice(),
        }
    }

    /// 現在の状態を返す。
    #[inline]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    fn ack(&mut self) {
        self.devices.dpram.write_word(hw::IRQ_RX, 0);
        self.state = DispatchState::Idle;
        self.devices.bridge.set_irq_enabled(IrqLine::Mailbox, true);
    }

    /// メールボックス割り込みを処理する。
    pub fn on_mailbox_irq(&mut self) {
        self.devices.bridge.set_irq_enabled(IrqLine::Mailbox, false);
        if self.state == DispatchState::AwaitingTransfer {
            log::warn!("mailbox irq while awaiting transfer");
            return;
        }

        self.state = DispatchState::Classifying;
        let dpram = &*self.devices.dpram;
        let word = dpram.read_word(hw::IRQ_STATE);
        let length = dpram.read_word(hw::IRQ_STATE_EXT);
        let rx_buff = dpram.read_word(hw::RX_BUFF);
        let tx_buff = dpram.read_word(hw::TX_BUFF);
        let handle = (word >> 8) & 0x1F;

        let Some(kind) = MessageKind::from_code(word as u8) else {
            log::debug!("unknown message type {:#06X}", word);
            self.ack();
            return;
        };
        log::trace!("mailbox {:?} handle {} len {}", kind, handle, length);

        let action = self.classify(kind, word, length as usize, rx_buff, tx_buff);
        match action {
            Action::Ack => {
                self.state = DispatchState::Dispatching;
                self.ack();
            }
            Action::EmptyReply => {
                self.state = DispatchState::Dispatching;
                let dpram = &*self.devices.dpram;
                dpram.write_word(hw::TX_LEN, 0);
                dpram.write_word(hw::RX_BUFF, 0);
                dpram.write_word(hw::TX_BUFF, 0);
                self.ack();
            }
            Action::Read { addr, len } => {
                // 転送は4バイト単位
                let rounded = (len + 3) & !3;
                if rounded > hw::MAX_TRANSFER {
                    log::debug!("{:?}: transfer of {} bytes rejected", kind, len);
                    self.ack();
                    return;
                }
                self.pending = Some(Pending {
                    kind,
                    handle,
                    length,
                    write: false,
                });
                self.state = DispatchState::AwaitingTransfer;
                self.devices.bridge.set_irq_enabled(IrqLine::TransferDone, true);
                self.devices.bridge.start_read(addr, rounded);
            }
            Action::Write { addr, len } => {
                self.devices.dpram.write_word(hw::TX_LEN, len as u16);
                self.pending = Some(Pending {
                    kind,
                    handle,
                    length: len as u16,
                    write: true,
                });
                self.state = DispatchState::AwaitingTransfer;
                self.devices.bridge.set_irq_enabled(IrqLine::TransferDone, true);
                self.devices.bridge.start_write(addr, &self.scratch[..len]);
            }
        }
    }

    fn classify(&mut self, kind: MessageKind, word: u16, len: usize, rx_buff: u16, tx_buff: u16) -> Action {
        let rx_addr = hw::DPRAM_BASE + rx_buff as u32;
        let tx_addr = hw::DPRAM_BASE + tx_buff as u32;
        match kind {
            MessageKind::Section | MessageKind::Ipmpe | MessageKind::Piping | MessageKind::CiGet => {
                if len == 0 || len > MAX_FILTERED {
                    log::debug!("{:?}: bad length {}", kind, len);
                    Action::Ack
                } else {
                    Action::Read { addr: rx_addr, len }
                }
            }
            MessageKind::DebugText => {
                if len == 0 || len > MAX_DEBUG {
                    Action::Ack
                } else {
                    Action::Read {
                        addr: hw::RESERVED,
                        len,
                    }
                }
            }
            MessageKind::IrCommand => Action::Read {
                addr: hw::RESERVED,
                len: 4,
            },
            MessageKind::TsRecord | MessageKind::PesRecord => {
                if len == 0 {
                    Action::Ack
                } else {
                    Action::Read { addr: rx_addr, len }
                }
            }
            MessageKind::PlaybackRequest => {
                let stream = &self.devices.stream;
                if stream.playing().is_none() {
                    return Action::EmptyReply;
                }
                let audio = word & PLAY_AUDIO != 0;
                let av = word & PLAY_AV != 0 && !stream.is_video_frozen();
                match self
                    .devices
                    .playback
                    .pull(&mut self.scratch[..self.chunk], audio, av)
                {
                    Some(len) => Action::Write { addr: rx_addr, len },
                    None => Action::EmptyReply,
                }
            }
            MessageKind::BitmapLoad => {
                let len = self
                    .devices
                    .bitmap
                    .next_chunk(len, &mut self.scratch[..self.chunk]);
                if len == 0 {
                    Action::Ack
                } else {
                    Action::Write { addr: tx_addr, len }
                }
            }
            MessageKind::CiPut => match self.devices.ci.pop_write(&mut self.scratch[..MAX_MESSAGE]) {
                Some(len) => Action::Write { addr: tx_addr, len },
                None => Action::EmptyReply,
            },
            MessageKind::CommonInterface
            | MessageKind::VideoEvent
            | MessageKind::PesPlay
            | MessageKind::TsPlay => Action::Ack,
        }
    }

    /// 転送完了割り込みを処理する。
    ///
    /// `data`は読み込み転送で得られたデータで、書き込み転送の場合は空でよい。
    pub fn on_transfer_done(&mut self, data: &[u8]) {
        self.devices.bridge.set_irq_enabled(IrqLine::TransferDone, false);
        let Some(pending) = self.pending.take() else {
            // 届いたばかりの通知を消さないよう、メールボックスには触れない
            log::warn!("transfer done while idle");
            self.state = DispatchState::Idle;
            self.devices.bridge.set_irq_enabled(IrqLine::Mailbox, true);
            return;
        };

        self.state = DispatchState::Dispatching;
        if pending.write {
            self.devices.dpram.write_word(hw::TX_BUFF, 0);
        } else {
            let len = std::cmp::min(data.len(), pending.length as usize);
            self.dispatch(InboundMessage {
                kind: pending.kind,
                handle: pending.handle,
                length: pending.length,
                payload: &data[..len],
            });
            self.devices.dpram.write_word(hw::RX_BUFF, 0);
        }
        self.ack();
    }

    fn dispatch(&self, msg: InboundMessage) {
        match msg.kind {
            MessageKind::Section | MessageKind::Ipmpe | MessageKind::Piping => {
                self.deliver(Delivery::Filtered {
                    kind: msg.kind,
                    handle: msg.handle,
                    data: msg.payload.to_vec(),
                });
            }
            MessageKind::CiGet => self.deliver(Delivery::CiGet(msg.payload.to_vec())),
            MessageKind::TsRecord => self.deliver(Delivery::TsRecord(msg.payload.to_vec())),
            MessageKind::PesRecord => {
                let class = match msg.handle {
                    0 => StreamClass::Audio,
                    1 => StreamClass::Video,
                    handle => {
                        log::debug!("record data for unknown stream {}", handle);
                        return;
                    }
                };
                self.deliver(Delivery::PesRecord {
                    class,
                    data: msg.payload.to_vec(),
                });
            }
            MessageKind::DebugText => {
                let text = msg.payload.split(|&b| b == 0).next().unwrap_or_default();
                log::info!("coprocessor: {}", String::from_utf8_lossy(text).trim_end());
            }
            MessageKind::IrCommand => match <[u8; 4]>::try_from(msg.payload) {
                Ok(bytes) => {
                    self.devices.ir.dispatch(self.ir_device, decode_ir_code(bytes));
                }
                Err(_) => log::debug!("short ir code ({} bytes)", msg.payload.len()),
            },
            kind => log::debug!("unexpected transfer for {:?}", kind),
        }
    }

    fn deliver(&self, delivery: Delivery) {
        match self.deliveries.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(delivery)) => {
                log::warn!("delivery queue full, dropping {}", describe(&delivery));
            }
            Err(TrySendError::Disconnected(_)) => log::debug!("stream router gone"),
        }
    }
}

fn describe(delivery: &Delivery) -> String {
    match delivery {
        Delivery::TsRecord(data) => format!("ts record ({} bytes)", data.len()),
        Delivery::PesRecord { class, data } => format!("{:?} pes record ({} bytes)", class, data.len()),
        Delivery::Filtered { kind, handle, data } => {
            format!("{:?} for filter {} ({} bytes)", kind, handle, data.len())
        }
        Delivery::CiGet(data) => format!("ci message ({} bytes)", data.len()),
    }
}

impl fmt::Debug for MailboxDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MailboxDispatcher")
            .field("state", &self.state)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}
