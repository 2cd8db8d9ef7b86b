//! TSパケットからデコーダー向けPESへの再パケット化。

use arrayvec::ArrayVec;

use crate::packet::Packet;
use crate::pes::{StreamId, START_CODE};
use crate::utils::BytesExt;

/// 再パケット化したPESの既定の最大長。
pub const DEFAULT_MAX_PACKET: usize = 2048;

/// 拡張ヘッダまでの長さ。
const HEAD_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// 開始コードを探している。値は一致したバイト数。
    Sync(u8),
    /// ヘッダを読んでいる。
    Header,
    /// ペイロードを出力している。`None`は長さ無指定のPES。
    Body(Option<usize>),
    /// 再パケット化しないPESを読み飛ばしている。
    Skip(usize),
}

/// 任意の境界で届くPESを、`max`バイト以下のPESに詰め直す。
///
/// 最初のPESは元のヘッダを保ち、分割された続きは`00 00 01 sid LL LL 80 00 00`のヘッダで始まる。
/// 長さ無指定のPESは[`flush`](PesRepacker::flush)で区切られる。
#[derive(Debug, Clone)]
pub struct PesRepacker {
    max: usize,
    head: ArrayVec<u8, HEAD_SIZE>,
    buf: Vec<u8>,
    state: State,
}

impl PesRepacker {
    /// 最大長`max`の`PesRepacker`を生成する。
    ///
    /// `max`は10〜65541の範囲に丸められる。
    pub fn new(max: usize) -> PesRepacker {
        let max = max.clamp(HEAD_SIZE + 1, 0xFFFF + 6);
        PesRepacker {
            max,
            head: ArrayVec::new(),
            buf: Vec::with_capacity(max),
            state: State::Sync(0),
        }
    }

    /// 出力するPESの最大長を返す。
    #[inline]
    pub fn max_packet(&self) -> usize {
        self.max
    }

    /// 読み込み途中の状態を捨てる。
    pub fn reset(&mut self) {
        self.head.clear();
        self.buf.clear();
        self.state = State::Sync(0);
    }

    /// 出力途中のPESがあれば送り出し、状態を初期化する。
    pub fn flush<F: FnMut(&[u8])>(&mut self, mut emit: F) {
        if let State::Body(remaining) = self.state {
            if let Some(left) = remaining {
                log::debug!("flushing unfinished PES ({} bytes left)", left);
            }
            self.send(&mut emit);
        }
        self.reset();
    }

    /// `data`を読み込み、できあがったPESごとに`emit`を呼ぶ。
    pub fn push<F: FnMut(&[u8])>(&mut self, mut data: &[u8], mut emit: F) {
        while let Some((&b, rest)) = data.split_first() {
            match self.state {
                State::Sync(matched) => {
                    self.state = match (matched, b) {
                        (0 | 1, 0x00) => State::Sync(matched + 1),
                        (2, 0x00) => State::Sync(2),
                        (2, 0x01) => State::Sync(3),
                        (3, sid) if StreamId(sid).starts_unit() => {
                            self.head.clear();
                            let _result = self.head.try_extend_from_slice(&START_CODE);
                            debug_assert!(_result.is_ok());
                            self.head.push(sid);
                            State::Header
                        }
                        // 識別子として扱えないバイトは開始コードの先頭として見直す
                        (3, _) => {
                            self.state = State::Sync(0);
                            continue;
                        }
                        _ => State::Sync(0),
                    };
                    data = rest;
                }
                State::Header => {
                    self.head.push(b);
                    data = rest;
                    self.on_header_byte();
                }
                State::Body(remaining) => {
                    let len = remaining
                        .unwrap_or(usize::MAX)
                        .min(data.len())
                        .min(self.max - self.buf.len());
                    self.buf.extend_from_slice(&data[..len]);
                    data = &data[len..];

                    if self.buf.len() == self.max {
                        self.send(&mut emit);
                    }
                    match remaining.map(|r| r - len) {
                        Some(0) => {
                            self.send(&mut emit);
                            self.reset();
                        }
                        remaining => self.state = State::Body(remaining),
                    }
                }
                State::Skip(remaining) => {
                    let len = remaining.min(data.len());
                    data = &data[len..];
                    self.state = match remaining - len {
                        0 => State::Sync(0),
                        remaining => State::Skip(remaining),
                    };
                }
            }
        }
    }

    fn on_header_byte(&mut self) {
        let sid = StreamId(self.head[3]);
        match self.head.len() {
            6 => {
                let plength = self.head[4..6].read_be_16() as usize;
                if !sid.has_additional_header() {
                    // パディングなどはデコーダーに渡さない
                    self.state = if plength == 0 {
                        State::Sync(0)
                    } else {
                        State::Skip(plength)
                    };
                }
            }
            7 => {
                if self.head[6] & 0xC0 != 0x80 {
                    let plength = self.head[4..6].read_be_16() as usize;
                    log::debug!("skipping non MPEG-2 PES header: {:?}", sid);
                    self.state = match plength.saturating_sub(1) {
                        0 => State::Sync(0),
                        remaining => State::Skip(remaining),
                    };
                }
            }
            HEAD_SIZE => {
                let plength = self.head[4..6].read_be_16() as usize;
                self.buf.clear();
                self.buf.extend_from_slice(&self.head);
                self.state = match plength {
                    0 => State::Body(None),
                    1 | 2 => {
                        log::debug!("corrupted PES length: {}", plength);
                        State::Sync(0)
                    }
                    // ヘッダのみ
                    3 => State::Sync(0),
                    _ => State::Body(Some(plength - 3)),
                };
            }
            _ => {}
        }
    }

    /// バッファをPESとして送り出し、続きのためのヘッダを用意する。
    fn send<F: FnMut(&[u8])>(&mut self, emit: &mut F) {
        if self.buf.len() <= HEAD_SIZE {
            return;
        }

        let len = (self.buf.len() - 6) as u16;
        self.buf[4..6].copy_from_slice(&len.to_be_bytes());
        emit(&self.buf);

        self.buf.truncate(6);
        self.buf.extend_from_slice(&[0x80, 0x00, 0x00]);
    }
}

/// TSパケットのペイロードを[`PesRepacker`]に渡す。
#[derive(Debug, Clone)]
pub struct TsToPes {
    repacker: PesRepacker,
}

impl TsToPes {
    /// 最大長`max`のPESを出力する`TsToPes`を生成する。
    pub fn new(max: usize) -> TsToPes {
        TsToPes {
            repacker: PesRepacker::new(max),
        }
    }

    /// 内部の[`PesRepacker`]を返す。
    #[inline]
    pub fn repacker(&self) -> &PesRepacker {
        &self.repacker
    }

    /// 内部の[`PesRepacker`]を返す。
    ///
    /// TSを経由しないPESを同じ状態で再パケット化する場合に使う。
    #[inline]
    pub fn repacker_mut(&mut self) -> &mut PesRepacker {
        &mut self.repacker
    }

    /// `packet`を読み込み、できあがったPESごとに`emit`を呼ぶ。
    ///
    /// エラーインジケーターが立っている場合は途中の状態を捨て、`false`を返す。
    pub fn write_packet<F: FnMut(&[u8])>(&mut self, packet: &Packet, mut emit: F) -> bool {
        if packet.error_indicator() {
            log::debug!("transport error on {:?}", packet.pid());
            self.repacker.reset();
            return false;
        }
        if !packet.has_payload() {
            return false;
        }

        if packet.unit_start_indicator() {
            self.repacker.flush(&mut emit);
        }
        if let Some(payload) = packet.payload() {
            self.repacker.push(payload, emit);
        }
        true
    }

    /// 出力途中のPESを送り出す。
    pub fn flush<F: FnMut(&[u8])>(&mut self, emit: F) {
        self.repacker.flush(emit);
    }

    /// 読み込み途中の状態を捨てる。
    pub fn reset(&mut self) {
        self.repacker.reset();
    }
}
