//! デコーダーへ渡す再生データのバッファ。

use mpegts::{Packet, StreamId, TsToPes};
use parking_lot::Mutex;

use crate::config::CardConfig;
use crate::error::{Error, Result};
use crate::ring_buf::RingBuffer;

/// 再生するストリームの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamClass {
    /// 音声。
    Audio,
    /// 映像。
    Video,
}

impl StreamClass {
    /// 配列の添字として使う値を返す。
    #[inline]
    pub fn index(self) -> usize {
        match self {
            StreamClass::Audio => 0,
            StreamClass::Video => 1,
        }
    }
}

/// 映像・音声の再生バッファと、そこへ書き込むための再パケット化の状態。
///
/// 書き込まれたPESは最大`playback_chunk`バイトのPESに詰め直されて再生バッファへ入り、
/// コプロセッサからの要求に応じて[`pull`](Playback::pull)で取り出される。
pub struct Playback {
    av: RingBuffer,
    audio: RingBuffer,
    repackers: Mutex<[TsToPes; 2]>,
    free_threshold: usize,
    chunk: usize,
}

impl Playback {
    /// `config`に従って`Playback`を生成する。
    pub fn new(config: &CardConfig) -> Playback {
        let chunk = config.playback_chunk;
        Playback {
            av: RingBuffer::with_low_water(config.av_buffer_size, chunk),
            audio: RingBuffer::with_low_water(config.audio_buffer_size, chunk),
            repackers: Mutex::new([TsToPes::new(chunk), TsToPes::new(chunk)]),
            free_threshold: config.playback_free_threshold,
            chunk,
        }
    }

    /// 映像・音声の再生バッファを返す。
    #[inline]
    pub fn av_buffer(&self) -> &RingBuffer {
        &self.av
    }

    /// 音声の再生バッファを返す。
    #[inline]
    pub fn audio_buffer(&self) -> &RingBuffer {
        &self.audio
    }

    #[inline]
    fn has_room(&self) -> bool {
        self.av.free() >= self.free_threshold && self.audio.free() >= self.free_threshold
    }

    /// 両方の再生バッファに十分な空きができるまで待機する。
    ///
    /// `nonblock`の場合は待機せず`Error::WouldBlock`を返す。
    pub fn reserve(&self, nonblock: bool) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.has_room() {
            return Ok(());
        }
        if nonblock {
            return Err(Error::WouldBlock);
        }
        self.wait_room()
    }

    fn wait_room(&self) -> Result<()> {
        while !self.has_room() {
            self.av.wait_free(self.free_threshold, false)?;
            self.audio.wait_free(self.free_threshold, false)?;
        }
        Ok(())
    }

    /// `class`のPESを書き込み、受け付けたバイト数を返す。
    ///
    /// 両方の再生バッファに十分な空きがあるときだけ受け付ける。
    /// `nonblock`の場合、まったく受け付けられなければ`Error::WouldBlock`を返す。
    pub fn write(&self, class: StreamClass, data: &[u8], nonblock: bool) -> Result<usize> {
        if nonblock && !data.is_empty() && !self.has_room() {
            return Err(Error::WouldBlock);
        }

        let mut done = 0;
        for step in data.chunks(self.chunk * 2) {
            if !self.has_room() {
                if nonblock {
                    break;
                }
                match self.wait_room() {
                    Ok(()) => {}
                    Err(e) if done == 0 => return Err(e),
                    Err(_) => break,
                }
            }

            let mut repackers = self.repackers.lock();
            let mut result = Ok(());
            repackers[class.index()]
                .repacker_mut()
                .push(step, |pes| self.route(class, pes, false, &mut result));
            drop(repackers);
            match result {
                Ok(()) => done += step.len(),
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(done)
    }

    /// デコーダー向けのフィードに届いたTSパケットを再生バッファへ書き込む。
    ///
    /// 待機はしない。空きが足りなければ組み上がったPESを捨てて`Error::WouldBlock`を返すため、
    /// 呼び出し側は先に[`reserve`](Playback::reserve)で空きを確保しておく。
    pub fn write_ts_to_decoder(&self, class: StreamClass, packet: &Packet) -> Result<()> {
        let mut repackers = self.repackers.lock();
        let mut result = Ok(());
        repackers[class.index()].write_packet(packet, |pes| self.route(class, pes, true, &mut result));
        result
    }

    fn route(&self, class: StreamClass, pes: &[u8], nonblock: bool, result: &mut Result<()>) {
        if result.is_err() {
            return;
        }
        let ring = match class {
            StreamClass::Video if StreamId(pes[3]).is_video() => &self.av,
            _ => &self.audio,
        };
        if nonblock && !ring.is_closed() && ring.free() < pes.len() {
            log::debug!("{:?}: no room for {} bytes", class, pes.len());
            *result = Err(Error::WouldBlock);
            return;
        }
        if let Err(e) = ring.write(pes, nonblock) {
            *result = Err(e);
        }
    }

    /// コプロセッサへ送るPESを1つ`dest`に取り出し、その長さを返す。
    ///
    /// 音声バッファを優先し、`av`が`true`の場合に限り映像・音声バッファから取り出す。
    pub fn pull(&self, dest: &mut [u8], audio: bool, av: bool) -> Option<usize> {
        let dest_len = std::cmp::min(dest.len(), self.chunk);
        let dest = &mut dest[..dest_len];

        let len = if audio { self.audio.read_framed(dest) } else { None };
        len.or_else(|| if av { self.av.read_framed(dest) } else { None })
    }

    /// 再生バッファを空にし、書き込み待ちの呼び出しを起こす。
    pub fn flush(&self) {
        self.av.flush();
        self.audio.flush();
    }

    /// 再パケット化の状態を初期化する。
    pub fn reset_repackers(&self) {
        let mut repackers = self.repackers.lock();
        for repacker in repackers.iter_mut() {
            repacker.reset();
        }
    }

    /// 再生バッファが閉じられているかどうかを返す。
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.av.is_closed()
    }

    /// 再生バッファを閉じる。
    pub fn close(&self) {
        self.av.close();
        self.audio.close();
    }
}

impl std::fmt::Debug for Playback {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Playback")
            .field("av", &self.av)
            .field("audio", &self.audio)
            .finish_non_exhaustive()
    }
}
