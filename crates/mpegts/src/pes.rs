//! PES用のモジュール。

use thiserror::Error;

use crate::utils::BytesExt;

/// PESの開始コード。
pub const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// ストリーム識別子。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u8);

impl StreamId {
    /// プログラムストリームマップ。
    pub const PROGRAM_STREAM_MAP: StreamId = StreamId(0xBC);
    /// プライベートストリーム1。
    pub const PRIVATE_STREAM_1: StreamId = StreamId(0xBD);
    /// パディングストリーム。
    pub const PADDING_STREAM: StreamId = StreamId(0xBE);
    /// プライベートストリーム2。
    pub const PRIVATE_STREAM_2: StreamId = StreamId(0xBF);
    /// 最初の音声ストリーム。
    pub const AUDIO_FIRST: StreamId = StreamId(0xC0);
    /// 最後の音声ストリーム。
    pub const AUDIO_LAST: StreamId = StreamId(0xDF);
    /// 最初の映像ストリーム。
    pub const VIDEO_FIRST: StreamId = StreamId(0xE0);
    /// 最後の映像ストリーム。
    pub const VIDEO_LAST: StreamId = StreamId(0xEF);
    /// ECMストリーム。
    pub const ECM_STREAM: StreamId = StreamId(0xF0);
    /// EMMストリーム。
    pub const EMM_STREAM: StreamId = StreamId(0xF1);
    /// DSMCCストリーム。
    pub const DSMCC_STREAM: StreamId = StreamId(0xF2);
    /// ISO/IEC 13522で定義されるストリーム。
    pub const ISO_IEC_13522_STREAM: StreamId = StreamId(0xF3);
    /// プログラムストリームディレクトリ。
    pub const PROGRAM_STREAM_DIRECTORY: StreamId = StreamId(0xFF);

    /// 音声ストリームかどうかを返す。
    #[inline]
    pub fn is_audio(self) -> bool {
        (StreamId::AUDIO_FIRST..=StreamId::AUDIO_LAST).contains(&self)
    }

    /// 映像ストリームかどうかを返す。
    #[inline]
    pub fn is_video(self) -> bool {
        (StreamId::VIDEO_FIRST..=StreamId::VIDEO_LAST).contains(&self)
    }

    /// デコーダーへ渡せるストリーム（音声・映像・プライベートストリーム1）かどうかを返す。
    #[inline]
    pub fn is_playable(self) -> bool {
        self.is_audio() || self.is_video() || self == StreamId::PRIVATE_STREAM_1
    }

    /// この識別子で始まるPESをTSパケット化の区切りとして扱うかどうかを返す。
    pub fn starts_unit(self) -> bool {
        self.is_playable()
            || matches!(
                self,
                StreamId::PROGRAM_STREAM_MAP
                    | StreamId::PRIVATE_STREAM_2
                    | StreamId::PROGRAM_STREAM_DIRECTORY
                    | StreamId::ECM_STREAM
                    | StreamId::EMM_STREAM
                    | StreamId::PADDING_STREAM
                    | StreamId::DSMCC_STREAM
                    | StreamId::ISO_IEC_13522_STREAM
            )
    }

    /// PESヘッダに拡張ヘッダ（フラグ2バイトとヘッダ長）が続くかどうかを返す。
    pub fn has_additional_header(self) -> bool {
        !matches!(
            self,
            StreamId::PROGRAM_STREAM_MAP
                | StreamId::PADDING_STREAM
                | StreamId::PRIVATE_STREAM_2
                | StreamId::ECM_STREAM
                | StreamId::EMM_STREAM
                | StreamId::PROGRAM_STREAM_DIRECTORY
                | StreamId::DSMCC_STREAM
                | StreamId::ISO_IEC_13522_STREAM
        )
    }
}

/// `buf`からPESの開始位置を探す。
///
/// 開始コードに[`StreamId::starts_unit`]を満たす識別子が続く位置を返す。
/// 見つからない場合は、末尾に残った開始コードの断片の長さ（0〜3）を`Err`で返す。
/// 断片の長さは、末尾が`00`なら1、`00 00`なら2、`00 00 01`なら3である。
pub fn find_pes_header(buf: &[u8]) -> Result<usize, u8> {
    let mut c = 0;
    while c + 3 < buf.len() {
        match memchr::memchr(0x01, &buf[c + 2..buf.len() - 1]) {
            None => break,
            Some(pos) => {
                let start = c + pos;
                if buf[start..start + 2] == [0x00, 0x00] && StreamId(buf[start + 3]).starts_unit() {
                    return Ok(start);
                }
                c = start + 1;
            }
        }
    }

    Err(trailing_fragment(buf))
}

/// `buf`の末尾にある開始コードの断片の長さを返す。
fn trailing_fragment(buf: &[u8]) -> u8 {
    if buf.ends_with(&START_CODE) {
        3
    } else if buf.ends_with(&[0x00, 0x00]) {
        2
    } else if buf.ends_with(&[0x00]) {
        1
    } else {
        0
    }
}

/// [`PesPacket::parse`]で発生するエラー。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PesError {
    /// PESパケットの長さが足りない。
    #[error("insufficient length of a PES packet")]
    InsufficientLength,

    /// PESパケットの開始コードが不正。
    #[error("invalid start code")]
    InvalidStartCode,

    /// PESパケットに最低限必要なバイト数がなく、壊れたパケットである。
    #[error("corrupt PES packet")]
    Corrupted,
}

/// PESのパケット。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesPacket<'a> {
    /// ストリーム識別子。
    pub stream_id: StreamId,

    /// PES_packet_length。映像では0（長さ無指定）の場合がある。
    pub packet_length: u16,

    /// 拡張ヘッダがある場合、PTS・DTSフラグ（2ビット）。
    pub pts_dts_flags: Option<u8>,

    /// 拡張ヘッダを含むヘッダ全体。
    pub header_data: &'a [u8],

    /// PESのデータ。
    pub data: &'a [u8],
}

impl<'a> PesPacket<'a> {
    /// PESパケットをパースして[`PesPacket`]として返す。
    ///
    /// `packet_length`が0の場合は`data`の末尾までをパケットとみなす。
    pub fn parse(data: &'a [u8]) -> Result<PesPacket<'a>, PesError> {
        if data.len() < 6 {
            return Err(PesError::InsufficientLength);
        }
        if data[0..=2] != START_CODE {
            return Err(PesError::InvalidStartCode);
        }

        let stream_id = StreamId(data[3]);
        let packet_length = data[4..=5].read_be_16();
        let data = if packet_length == 0 {
            data
        } else {
            data.get(..6 + packet_length as usize)
                .ok_or(PesError::InsufficientLength)?
        };

        let (pts_dts_flags, mid) = if stream_id.has_additional_header() {
            if data.len() < 9 {
                return Err(PesError::Corrupted);
            }
            let mid = 9 + data[8] as usize;
            if data.len() < mid {
                return Err(PesError::Corrupted);
            }
            (Some((data[7] & 0b11000000) >> 6), mid)
        } else {
            (None, 6)
        };

        let (header_data, data) = data.split_at(mid);
        Ok(PesPacket {
            stream_id,
            packet_length,
            pts_dts_flags,
            header_data,
            data,
        })
    }
}
