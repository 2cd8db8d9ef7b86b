//! 生産者と消費者の間でバイト列を受け渡すリングバッファ。

use std::fmt;

use mpegts::StreamId;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};

struct Inner {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    /// `flush`や`close`のたびに増え、待機中の呼び出しを中断させる。
    epoch: u64,
    closed: bool,
}

impl Inner {
    #[inline]
    fn avail(&self) -> usize {
        (self.write + self.buf.len() - self.read) % self.buf.len()
    }

    #[inline]
    fn free(&self) -> usize {
        self.buf.len() - self.avail() - 1
    }

    #[inline]
    fn peek(&self, offset: usize) -> u8 {
        self.buf[(self.read + offset) % self.buf.len()]
    }

    #[inline]
    fn skip(&mut self, len: usize) {
        self.read = (self.read + len) % self.buf.len();
    }

    fn copy_in(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        let first = std::cmp::min(data.len(), cap - self.write);
        self.buf[self.write..self.write + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.write = (self.write + data.len()) % cap;
    }

    fn copy_out(&mut self, dest: &mut [u8]) {
        let cap = self.buf.len();
        let first = std::cmp::min(dest.len(), cap - self.read);
        dest[..first].copy_from_slice(&self.buf[self.read..self.read + first]);
        let rest = dest.len() - first;
        dest[first..].copy_from_slice(&self.buf[..rest]);
        self.read = (self.read + dest.len()) % cap;
    }
}

/// 固定長のリングバッファ。
///
/// 満杯と空を区別するため、常に1バイトを空けておく。
/// すなわち`free() + avail() == capacity() - 1`が常に成り立つ。
///
/// 書き込みと読み込みはそれぞれ1つの役割から行われることを想定しているが、
/// ポインターの更新はすべて内部のロックで直列化される。
/// 待機中の呼び出しは[`flush`](RingBuffer::flush)や[`close`](RingBuffer::close)で起こされ、
/// `Error::Closed`を返す。
pub struct RingBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
    low_water: usize,
}

impl RingBuffer {
    /// 容量`capacity`の`RingBuffer`を生成する。
    ///
    /// 書き込み時に待機する空き容量の下限は容量の1/16とする。
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer::with_low_water(capacity, capacity / 16)
    }

    /// 書き込み時に待機する空き容量の下限を指定して`RingBuffer`を生成する。
    ///
    /// ブロッキングの書き込みは空き容量が`low_water`以下の間待機する。
    pub fn with_low_water(capacity: usize, low_water: usize) -> RingBuffer {
        let capacity = capacity.max(2);
        RingBuffer {
            inner: Mutex::new(Inner {
                buf: vec![0; capacity].into_boxed_slice(),
                read: 0,
                write: 0,
                epoch: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            low_water: low_water.min(capacity - 2),
        }
    }

    /// バッファの容量を返す。
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// 読み込めるバイト数を返す。
    #[inline]
    pub fn avail(&self) -> usize {
        self.inner.lock().avail()
    }

    /// 書き込めるバイト数を返す。
    #[inline]
    pub fn free(&self) -> usize {
        self.inner.lock().free()
    }

    /// 読み込めるデータが無い場合に`true`を返す。
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.avail() == 0
    }

    /// 閉じられているかどうかを返す。
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// 条件が満たされるまで待機する。
    ///
    /// 待機中に`flush`か`close`が呼ばれた場合は`Error::Closed`を返す。
    fn wait_until<F>(&self, inner: &mut MutexGuard<Inner>, nonblock: bool, mut cond: F) -> Result<()>
    where
        F: FnMut(&Inner) -> bool,
    {
        let epoch = inner.epoch;
        loop {
            if inner.closed || inner.epoch != epoch {
                return Err(Error::Closed);
            }
            if cond(&**inner) {
                return Ok(());
            }
            if nonblock {
                return Err(Error::WouldBlock);
            }
            self.cond.wait(inner);
        }
    }

    /// `data`を書き込み、書き込んだバイト数を返す。
    ///
    /// `nonblock`が`false`の場合、空き容量が下限以下であれば空くまで待機しながらすべて書き込む。
    /// `nonblock`が`true`の場合は書き込めるだけ書き込み、1バイトも書き込めなければ
    /// `Error::WouldBlock`を返す。
    pub fn write(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }

        let mut written = 0;
        while written < data.len() {
            if nonblock {
                if inner.free() == 0 {
                    break;
                }
            } else if inner.free() <= self.low_water {
                let low_water = self.low_water;
                match self.wait_until(&mut inner, false, |inner| inner.free() > low_water) {
                    Ok(()) => {}
                    Err(e) if written == 0 => return Err(e),
                    Err(_) => break,
                }
            }

            let len = std::cmp::min(inner.free(), data.len() - written);
            inner.copy_in(&data[written..written + len]);
            written += len;
            self.cond.notify_all();
        }

        if written == 0 && !data.is_empty() {
            return Err(Error::WouldBlock);
        }
        Ok(written)
    }

    /// 空き容量が`len`バイト以上になるまで待機する。
    pub fn wait_free(&self, len: usize, nonblock: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if len >= inner.buf.len() {
            return Err(Error::InvalidArgument("wait for more than capacity"));
        }
        self.wait_until(&mut inner, nonblock, |inner| inner.free() >= len)
    }

    /// 読み込めるデータが届くまで待機する。
    pub fn wait_avail(&self, nonblock: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        self.wait_until(&mut inner, nonblock, |inner| inner.avail() > 0)
    }

    /// `dest`に読み込み、読み込んだバイト数を返す。
    ///
    /// `nonblock`が`false`の場合はデータが届くまで待機する。
    pub fn read(&self, dest: &mut [u8], nonblock: bool) -> Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock();
        self.wait_until(&mut inner, nonblock, |inner| inner.avail() > 0)?;
        let len = std::cmp::min(inner.avail(), dest.len());
        inner.copy_out(&mut dest[..len]);
        self.cond.notify_all();
        Ok(len)
    }

    /// 先頭のPESを1つ`dest`に読み込み、その長さを返す。
    ///
    /// 先頭がデコーダーへ渡せるPESの開始コードでない場合は一致するまで1バイトずつ読み飛ばす。
    /// 6バイト未満しか無い場合、PES全体が揃っていない場合、`dest`に収まらない場合は`None`を返す。
    pub fn read_framed(&self, dest: &mut [u8]) -> Option<usize> {
        let mut inner = self.inner.lock();
        let result = self.read_framed_locked(&mut inner, dest);
        self.cond.notify_all();
        result
    }

    fn read_framed_locked(&self, inner: &mut Inner, dest: &mut [u8]) -> Option<usize> {
        if dest.is_empty() {
            return None;
        }

        let mut skipped = 0;
        loop {
            if inner.avail() < 6 {
                if skipped > 0 {
                    log::debug!("resync: skipped {} bytes", skipped);
                }
                return None;
            }
            if inner.peek(0) == 0x00
                && inner.peek(1) == 0x00
                && inner.peek(2) == 0x01
                && StreamId(inner.peek(3)).is_playable()
            {
                break;
            }
            inner.skip(1);
            skipped += 1;
        }
        if skipped > 0 {
            log::debug!("resync: skipped {} bytes", skipped);
        }

        let len = ((inner.peek(4) as usize) << 8 | inner.peek(5) as usize) + 6;
        if inner.avail() < len || dest.len() < len {
            return None;
        }
        inner.copy_out(&mut dest[..len]);
        Some(len)
    }

    /// 先頭から`offset`バイト目を読み込まずに返す。
    #[inline]
    pub fn peek(&self, offset: usize) -> Option<u8> {
        let inner = self.inner.lock();
        (offset < inner.avail()).then(|| inner.peek(offset))
    }

    /// `len`バイトを読み飛ばす。
    ///
    /// 読み込めるバイト数を超える場合は読み込める分だけ読み飛ばす。
    pub fn skip(&self, len: usize) {
        let mut inner = self.inner.lock();
        let len = std::cmp::min(len, inner.avail());
        inner.skip(len);
        self.cond.notify_all();
    }

    /// 書き込まれたデータを破棄し、待機中の呼び出しを起こす。
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.read = inner.write;
        inner.epoch = inner.epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// バッファを閉じ、待機中の呼び出しを起こす。
    ///
    /// 閉じた後の読み書きはすべて`Error::Closed`となる。
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.epoch = inner.epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// 閉じたバッファを空にして再び使えるようにする。
    pub fn reopen(&self) {
        let mut inner = self.inner.lock();
        inner.read = 0;
        inner.write = 0;
        inner.closed = false;
        self.cond.notify_all();
    }

    /// ロックを保持したまま`f`を呼ぶ。
    ///
    /// 複数の操作を不可分に行う場合に使う。
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce(&mut Locked) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut Locked(&mut inner));
        self.cond.notify_all();
        result
    }
}

/// ロックされた[`RingBuffer`]。
pub(crate) struct Locked<'a>(&'a mut Inner);

impl Locked<'_> {
    #[inline]
    pub fn avail(&self) -> usize {
        self.0.avail()
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.0.free()
    }

    #[inline]
    pub fn peek(&self, offset: usize) -> u8 {
        self.0.peek(offset)
    }

    #[inline]
    pub fn skip(&mut self, len: usize) {
        self.0.skip(len)
    }

    #[inline]
    pub fn write(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.free());
        self.0.copy_in(data)
    }

    #[inline]
    pub fn read(&mut self, dest: &mut [u8]) {
        debug_assert!(dest.len() <= self.avail());
        self.0.copy_out(dest)
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &inner.buf.len())
            .field("avail", &inner.avail())
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    fn pes(sid: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() + 3;
        let mut pes = vec![0x00, 0x00, 0x01, sid, (len >> 8) as u8, len as u8, 0x80, 0x00, 0x00];
        pes.extend_from_slice(payload);
        pes
    }

    #[test]
    fn test_write_read_wrap() {
        let rb = RingBuffer::new(16);
        assert_eq!(rb.free(), 15);

        let mut out = [0; 16];
        for round in 0..5u8 {
            let data: Vec<u8> = (0..11).map(|i| round * 16 + i).collect();
            assert_eq!(rb.write(&data, true), Ok(11));
            assert_eq!(rb.free() + rb.avail(), rb.capacity() - 1);
            assert_eq!(rb.read(&mut out[..7], true), Ok(7));
            assert_eq!(rb.read(&mut out[7..], true), Ok(4));
            assert_eq!(out[..11], data[..]);
        }
        assert!(rb.is_empty());
    }

    #[test]
    fn test_nonblocking_partial_write() {
        let rb = RingBuffer::new(8);
        assert_eq!(rb.write(&[1; 10], true), Ok(7));
        assert_eq!(rb.write(&[1], true), Err(Error::WouldBlock));
        assert_eq!(rb.free(), 0);

        let mut out = [0; 4];
        assert_matches!(RingBuffer::new(8).read(&mut out, true), Err(Error::WouldBlock));
    }

    #[test]
    fn test_read_framed() {
        let rb = RingBuffer::new(64);
        let first = pes(0xE0, &[1, 2, 3]);
        let second = pes(0xBD, &[4, 5]);

        rb.write(&[0x47, 0x00, 0x00, 0x01, 0xBE], true).unwrap();
        rb.write(&first, true).unwrap();
        rb.write(&second[..8], true).unwrap();

        let mut dest = [0; 32];
        assert_eq!(rb.read_framed(&mut dest), Some(first.len()));
        assert_eq!(dest[..first.len()], first[..]);

        // 揃っていないPESは読まない
        assert_eq!(rb.read_framed(&mut dest), None);
        rb.write(&second[8..], true).unwrap();
        assert_eq!(rb.read_framed(&mut dest[..8]), None);
        assert_eq!(rb.read_framed(&mut dest), Some(second.len()));
        assert_eq!(dest[..second.len()], second[..]);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_read_framed_wrap() {
        let rb = RingBuffer::new(32);
        let data = pes(0xC0, &[9; 10]);
        let mut dest = [0; 32];
        for _ in 0..4 {
            rb.write(&data, true).unwrap();
            assert_eq!(rb.read_framed(&mut dest), Some(data.len()));
            assert_eq!(dest[..data.len()], data[..]);
        }
    }

    #[test]
    fn test_peek_skip() {
        let rb = RingBuffer::new(8);
        rb.write(&[0x12, 0x34, 0x56], true).unwrap();
        assert_eq!(rb.peek(1), Some(0x34));
        assert_eq!(rb.peek(3), None);
        rb.skip(2);
        assert_eq!(rb.peek(0), Some(0x56));
        rb.skip(10);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_blocking_write_waits_for_reader() {
        let rb = Arc::new(RingBuffer::with_low_water(16, 4));
        rb.write(&[0; 12], true).unwrap();

        let reader = {
            let rb = rb.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                let mut out = [0; 16];
                rb.read(&mut out, false)
            })
        };
        assert_eq!(rb.write(&[1; 8], false), Ok(8));
        assert_eq!(reader.join().unwrap(), Ok(12));
        assert_eq!(rb.avail(), 8);
    }

    #[test]
    fn test_flush_wakes_waiters() {
        let rb = Arc::new(RingBuffer::new(16));
        let reader = {
            let rb = rb.clone();
            std::thread::spawn(move || {
                let mut out = [0; 4];
                rb.read(&mut out, false)
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        rb.flush();
        assert_eq!(reader.join().unwrap(), Err(Error::Closed));

        rb.write(&[1, 2], true).unwrap();
        rb.flush();
        assert!(rb.is_empty());
    }

    #[test]
    fn test_close() {
        let rb = Arc::new(RingBuffer::with_low_water(8, 2));
        rb.write(&[0; 7], true).unwrap();
        let writer = {
            let rb = rb.clone();
            std::thread::spawn(move || rb.write(&[1; 4], false))
        };
        std::thread::sleep(Duration::from_millis(20));
        rb.close();
        assert_eq!(writer.join().unwrap(), Err(Error::Closed));
        assert_eq!(rb.write(&[1], true), Err(Error::Closed));
        assert_eq!(rb.wait_free(1, true), Err(Error::Closed));

        rb.reopen();
        assert!(rb.is_empty());
        assert_eq!(rb.write(&[1], true), Ok(1));
    }
}
