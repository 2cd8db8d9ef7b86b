//! PESからTSパケットへの変換。

use arrayvec::ArrayVec;

use crate::packet::{Packet, HEADER_SIZE, PACKET_SIZE, PAYLOAD_SIZE, SYNC_BYTE};
use crate::pes::{self, StreamId, START_CODE};
use crate::pid::Pid;

/// TSヘッダと必要なスタッフィングを`buf`に書き込み、ペイロードの書き込み位置を返す。
///
/// `len`はこのパケットに載せるペイロード長で、184未満であればアダプテーションフィールドで埋める。
/// 連続性指標はパケットを書き込むたびに進める。
///
/// # パニック
///
/// `len`が184を超える場合はパニックする。
pub fn write_ts_header(
    pid: Pid,
    counter: &mut u8,
    pes_start: bool,
    len: usize,
    buf: &mut [u8; PACKET_SIZE],
) -> usize {
    assert!(len <= PAYLOAD_SIZE);

    let fill = PAYLOAD_SIZE - len;
    let [pid_hi, pid_lo] = pid.to_header_bytes();
    buf[0] = SYNC_BYTE;
    buf[1] = if pes_start { 0x40 } else { 0x00 } | pid_hi;
    buf[2] = pid_lo;
    buf[3] = if fill > 0 { 0x30 } else { 0x10 } | (*counter & 0x0F);
    *counter = counter.wrapping_add(1) & 0x0F;

    if fill > 0 {
        buf[4] = (fill - 1) as u8;
        if fill > 1 {
            buf[5] = 0x00;
            buf[6..HEADER_SIZE + fill].fill(0xFF);
        }
    }
    HEADER_SIZE + fill
}

/// `data`がPESの先頭から始まっているかどうかを返す。
fn starts_with_pes(data: &[u8]) -> bool {
    data.len() > 3 && data[..3] == START_CODE && StreamId(data[3]).starts_unit()
}

/// 1つのPES（あるいはその断片）をTSパケットに分割し、パケットごとに`emit`を呼ぶ。
///
/// `data`がPESの開始コードから始まる場合、最初のパケットにペイロードユニット開始インジケーターを立てる。
pub fn p_to_t<F: FnMut(&Packet)>(data: &[u8], pid: Pid, counter: &mut u8, mut emit: F) {
    let mut pes_start = starts_with_pes(data);
    for chunk in data.chunks(PAYLOAD_SIZE) {
        let mut packet = Packet([0; PACKET_SIZE]);
        let offset = write_ts_header(pid, counter, pes_start, chunk.len(), &mut packet.0);
        packet.0[offset..].copy_from_slice(chunk);
        emit(&packet);
        pes_start = false;
    }
}

/// 任意の境界で分割されて届くPESストリームをTSパケット化する。
///
/// 各PESは新しいパケットから始まり、直前のPESの端数はスタッフィングして送り出す。
/// 呼び出しの境界をまたぐ開始コードは断片として保持する。
#[derive(Debug, Clone)]
pub struct PesToTs {
    pid: Pid,
    counter: u8,
    pending: ArrayVec<u8, PAYLOAD_SIZE>,
    frags: u8,
}

impl PesToTs {
    /// `pid`向けの`PesToTs`を生成する。
    pub fn new(pid: Pid) -> PesToTs {
        PesToTs {
            pid,
            counter: 0,
            pending: ArrayVec::new(),
            frags: 0,
        }
    }

    /// 出力先のPIDを返す。
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// 次に使う連続性指標を返す。
    #[inline]
    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// 保留中のデータを捨て、連続性指標を0に戻す。
    pub fn reset(&mut self) {
        self.counter = 0;
        self.pending.clear();
        self.frags = 0;
    }

    /// `data`を追加し、完成したTSパケットごとに`emit`を呼ぶ。
    pub fn write<F: FnMut(&Packet)>(&mut self, mut data: &[u8], mut emit: F) {
        if self.frags > 0 {
            let frags = self.frags as usize;
            let rest = &START_CODE[frags..];
            let completes = data.len() > rest.len()
                && data.starts_with(rest)
                && StreamId(data[rest.len()]).starts_unit();
            if completes && frags <= self.pending.len() {
                // 保留の末尾にある開始コードの断片を次のPESへ回す
                let head_len = self.pending.len() - frags;
                let mut next = ArrayVec::<u8, PAYLOAD_SIZE>::new();
                next.extend(self.pending.drain(head_len..));
                self.emit_pending(&mut emit);
                self.pending = next;
            }
            self.frags = 0;
        }

        loop {
            // 先頭の開始コードは既に区切られているため、1バイト後から探す
            let search_from = usize::from(starts_with_pes(data) && self.pending.is_empty());
            let (chunk, next) = match pes::find_pes_header(&data[search_from.min(data.len())..]) {
                Ok(pos) => data.split_at(search_from + pos),
                Err(_) => (data, &[][..]),
            };

            self.append(chunk, &mut emit);
            if next.is_empty() {
                break;
            }
            self.emit_pending(&mut emit);
            data = next;
        }

        let tail = &self.pending[self.pending.len().saturating_sub(3)..];
        self.frags = pes::find_pes_header(tail).err().unwrap_or(0);
    }

    /// 保留中のデータをスタッフィングしてTSパケットとして送り出す。
    pub fn flush<F: FnMut(&Packet)>(&mut self, mut emit: F) {
        self.emit_pending(&mut emit);
        self.frags = 0;
    }

    fn append<F: FnMut(&Packet)>(&mut self, mut data: &[u8], emit: &mut F) {
        while !data.is_empty() {
            if self.pending.is_full() {
                self.emit_pending(emit);
            }
            let len = std::cmp::min(self.pending.remaining_capacity(), data.len());
            let _result = self.pending.try_extend_from_slice(&data[..len]);
            debug_assert!(_result.is_ok());
            data = &data[len..];
        }
    }

    fn emit_pending<F: FnMut(&Packet)>(&mut self, emit: &mut F) {
        if !self.pending.is_empty() {
            p_to_t(&self.pending, self.pid, &mut self.counter, &mut *emit);
            self.pending.clear();
        }
    }
}

/// 録画経路で受け取ったPESの映像長フィールドを0にする。
///
/// 映像PESはTSでは長さを持たないため、ストリーム識別子が0xE0のものだけを対象とする。
pub fn clear_video_length(pes: &mut [u8]) {
    if pes.len() >= 6 && pes[3] == StreamId::VIDEO_FIRST.0 {
        pes[4] = 0;
        pes[5] = 0;
    }
}

/// 録画経路で受け取ったPESを、フィードごとのPIDでTSパケット化する。
#[derive(Debug, Clone)]
pub struct RecordPacketizer {
    header: [u8; HEADER_SIZE],
    counter: u8,
}

impl RecordPacketizer {
    /// `pid`向けの`RecordPacketizer`を生成する。
    pub fn new(pid: Pid) -> RecordPacketizer {
        let [pid_hi, pid_lo] = pid.to_header_bytes();
        RecordPacketizer {
            header: [SYNC_BYTE, pid_hi, pid_lo, 0x10],
            counter: 0,
        }
    }

    /// 次のパケットに付ける連続性指標を返す。
    #[inline]
    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// `pes`をTSパケット化し、パケットごとに`emit`を呼ぶ。
    ///
    /// 184バイトに満たない端数は最後のパケットでスタッフィングする。
    pub fn write<F: FnMut(&Packet)>(&mut self, mut pes: &[u8], payload_start: bool, mut emit: F) {
        let mut packet = Packet([0xFF; PACKET_SIZE]);
        packet.0[..HEADER_SIZE].copy_from_slice(&self.header);
        if payload_start {
            packet.0[1] |= 0x40;
        }

        while pes.len() >= PAYLOAD_SIZE {
            packet.0[3] = 0x10 | self.next_counter();
            packet.0[HEADER_SIZE..].copy_from_slice(&pes[..PAYLOAD_SIZE]);
            emit(&packet);
            pes = &pes[PAYLOAD_SIZE..];
            packet.0[1] &= !0x40;
        }
        if pes.is_empty() {
            return;
        }

        packet.0[3] = 0x30 | self.next_counter();
        let rest = PAYLOAD_SIZE - 1 - pes.len();
        packet.0[4] = rest as u8;
        if rest > 0 {
            packet.0[5] = 0x00;
            packet.0[6..5 + rest].fill(0xFF);
        }
        packet.0[5 + rest..].copy_from_slice(pes);
        emit(&packet);
    }

    fn next_counter(&mut self) -> u8 {
        let cc = self.counter;
        self.counter = (self.counter + 1) & 0x0F;
        cc
    }
}
