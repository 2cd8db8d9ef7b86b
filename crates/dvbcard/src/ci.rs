//! Common Interfaceとの間でやり取りするメッセージのキュー。
//!
//! 送受信どちらのキューもメッセージを2バイトのビッグエンディアンの長さに続けて格納する。

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::ring_buf::RingBuffer;

/// 1メッセージの最大長。
pub const MAX_MESSAGE: usize = 2048;

/// CIスロットの数。
pub const SLOTS: usize = 2;

const PRESENT: u8 = 0x01;
const READY: u8 = 0x02;

/// CIスロットの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotFlags {
    /// モジュールが挿入されている。
    pub present: bool,
    /// モジュールが使用可能。
    pub ready: bool,
}

/// CIの送受信キューとスロットの状態。
#[derive(Debug)]
pub struct CiInterface {
    read: RingBuffer,
    write: RingBuffer,
    slots: [AtomicU8; SLOTS],
}

impl CiInterface {
    /// 各キューの容量を`capacity`として`CiInterface`を生成する。
    pub fn new(capacity: usize) -> CiInterface {
        CiInterface {
            read: RingBuffer::new(capacity),
            write: RingBuffer::new(capacity),
            slots: [AtomicU8::new(0), AtomicU8::new(0)],
        }
    }

    /// `payload`がスロットの状態通知であれば状態を更新して`true`を返す。
    pub fn update_slot_status(&self, payload: &[u8]) -> bool {
        if payload.len() < 6 || payload[0] as usize >= SLOTS || payload[2] != 0xFF {
            return false;
        }

        let mut flags = 0;
        if payload[5] > 0 {
            flags |= PRESENT;
        }
        if payload[5] > 5 {
            flags |= READY;
        }
        self.slots[payload[0] as usize].store(flags, Ordering::Release);
        log::debug!("ci slot {}: {:?}", payload[0], self.slot_flags(payload[0] as usize));
        true
    }

    /// スロット`slot`の状態を返す。
    pub fn slot_flags(&self, slot: usize) -> SlotFlags {
        let flags = self
            .slots
            .get(slot)
            .map_or(0, |s| s.load(Ordering::Acquire));
        SlotFlags {
            present: flags & PRESENT != 0,
            ready: flags & READY != 0,
        }
    }

    /// コプロセッサから届いたメッセージを受信キューへ入れる。
    ///
    /// 収まらない場合は破棄して`false`を返す。
    pub fn push_read(&self, data: &[u8]) -> bool {
        let pushed = self.read.with_locked(|ring| {
            if data.len() > u16::MAX as usize || ring.free() < data.len() + 2 {
                return false;
            }
            ring.write(&(data.len() as u16).to_be_bytes());
            ring.write(data);
            true
        });
        if !pushed {
            log::debug!("ci read queue full, dropping {} bytes", data.len());
        }
        pushed
    }

    /// 受信キューからメッセージを1つ`dest`へ読み込み、その長さを返す。
    ///
    /// メッセージが`dest`に収まらない場合は`Error::InvalidArgument`を返す。
    pub fn read_message(&self, dest: &mut [u8], nonblock: bool) -> Result<usize> {
        self.read.wait_avail(nonblock)?;
        self.read.with_locked(|ring| {
            if ring.avail() < 4 {
                return Ok(0);
            }
            let len = (ring.peek(0) as usize) << 8 | ring.peek(1) as usize;
            if ring.avail() < len + 2 || dest.len() < len {
                return Err(Error::InvalidArgument("ci message does not fit"));
            }
            ring.skip(2);
            ring.read(&mut dest[..len]);
            Ok(len)
        })
    }

    /// コプロセッサへ送るメッセージを送信キューへ入れる。
    pub fn write_message(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        if data.len() > MAX_MESSAGE {
            return Err(Error::InvalidArgument("ci message too long"));
        }

        self.write.wait_free(data.len() + 2, nonblock)?;
        self.write.with_locked(|ring| {
            if ring.free() < data.len() + 2 {
                return Err(Error::WouldBlock);
            }
            ring.write(&(data.len() as u16).to_be_bytes());
            ring.write(data);
            Ok(data.len())
        })
    }

    /// 送信キューから完全なメッセージを1つ`dest`へ取り出し、その長さを返す。
    pub fn pop_write(&self, dest: &mut [u8]) -> Option<usize> {
        self.write.with_locked(|ring| {
            if ring.avail() <= 2 {
                return None;
            }
            let len = (ring.peek(0) as usize) << 8 | ring.peek(1) as usize;
            if ring.avail() < len + 2 || dest.len() < len {
                return None;
            }
            ring.skip(2);
            ring.read(&mut dest[..len]);
            Some(len)
        })
    }

    /// 両方のキューを空にする。
    pub fn flush(&self) {
        self.read.flush();
        self.write.flush();
    }

    /// 両方のキューを閉じる。
    pub fn close(&self) {
        self.read.close();
        self.write.close();
    }
}
