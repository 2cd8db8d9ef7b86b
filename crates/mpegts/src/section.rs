//! セクションフィルターとセクションの再構成。

use arrayvec::ArrayVec;
use thiserror::Error;

use crate::packet::Packet;
use crate::utils::BytesExt;

/// フィルターが比較するバイト数。
pub const FILTER_SIZE: usize = 16;

/// セクションの最大長。
pub const MAX_SECTION_SIZE: usize = 3 + 4093;

/// セクション検査で発生するエラー。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SectionError {
    /// セクションヘッダを読むだけの長さが無い。
    #[error("section too short")]
    Truncated,

    /// section_lengthとバッファ長が一致しない。
    #[error("section length mismatch (declared {declared}, actual {actual})")]
    LengthMismatch {
        /// section_lengthから求めた長さ。
        declared: usize,
        /// 実際のバッファ長。
        actual: usize,
    },
}

/// セクションの12ビット長から求めたセクション全体の長さが`section`の長さと一致するか確認する。
pub fn check_length(section: &[u8]) -> Result<(), SectionError> {
    if section.len() < 3 {
        return Err(SectionError::Truncated);
    }

    let declared = (section[1..=2].read_be_16() & 0x0FFF) as usize + 3;
    if declared != section.len() {
        return Err(SectionError::LengthMismatch {
            declared,
            actual: section.len(),
        });
    }
    Ok(())
}

/// セクションフィルター。
///
/// `value`と`mask`はハードウェアフィルターへ渡され、`mask`のビットが立っている位置だけ比較される。
/// `negate_mask`のビットが立っている位置は、ハードウェアを通過した後にソフトウェアで
/// `value`と一致することを確認する。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SectionFilter {
    /// 比較する値。
    pub value: [u8; FILTER_SIZE],
    /// 比較するビット。
    pub mask: [u8; FILTER_SIZE],
    /// ソフトウェアで一致を確認するビット。
    pub negate_mask: [u8; FILTER_SIZE],
}

impl SectionFilter {
    /// `SectionFilter`を生成する。
    #[inline]
    pub fn new(
        value: [u8; FILTER_SIZE],
        mask: [u8; FILTER_SIZE],
        negate_mask: [u8; FILTER_SIZE],
    ) -> SectionFilter {
        SectionFilter {
            value,
            mask,
            negate_mask,
        }
    }

    /// テーブル識別子だけを比較するフィルターを生成する。
    #[inline]
    pub fn table_id(table_id: u8) -> SectionFilter {
        let mut filter = SectionFilter::default();
        filter.value[0] = table_id;
        filter.mask[0] = 0xFF;
        filter
    }

    /// ソフトウェアでの一致確認が必要かどうかを返す。
    #[inline]
    pub fn doneq(&self) -> bool {
        self.negate_mask.iter().any(|&b| b != 0)
    }

    /// ハードウェアで絞り込まれたセクションがこのフィルターを通過するかどうかを返す。
    ///
    /// 長さ検査に加え、`doneq`の場合は`negate_mask`の位置が`value`と一致することを確認する。
    pub fn matches(&self, section: &[u8]) -> bool {
        if let Err(e) = check_length(section) {
            log::debug!("section rejected: {}", e);
            return false;
        }

        !self.doneq()
            || self
                .value
                .iter()
                .zip(&self.negate_mask)
                .zip(section)
                .all(|((&value, &negate), &byte)| (value ^ byte) & negate == 0)
    }

    /// `mask`による比較も含めてソフトウェアだけで判定する。
    pub fn matches_masked(&self, section: &[u8]) -> bool {
        self.value
            .iter()
            .zip(&self.mask)
            .zip(section)
            .all(|((&value, &mask), &byte)| (value ^ byte) & mask == 0)
            && self.matches(section)
    }

    /// ハードウェアフィルターに渡す`value << 8 | mask`の16ワードを返す。
    pub fn to_words(&self) -> [u16; FILTER_SIZE] {
        let mut words = [0; FILTER_SIZE];
        for (word, (&value, &mask)) in words.iter_mut().zip(self.value.iter().zip(&self.mask)) {
            *word = (value as u16) << 8 | mask as u16;
        }
        words
    }
}

/// TSパケットからセクションを組み立てる。
#[derive(Clone)]
pub struct SectionAssembler {
    buffer: Box<ArrayVec<u8, MAX_SECTION_SIZE>>,
    synced: bool,
    last_cc: u8,
}

impl SectionAssembler {
    /// `SectionAssembler`を生成する。
    pub fn new() -> SectionAssembler {
        SectionAssembler {
            buffer: Box::new(ArrayVec::new()),
            synced: false,
            last_cc: 0x10,
        }
    }

    /// 組み立て途中のセクションを破棄する。
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.synced = false;
        self.last_cc = 0x10;
    }

    /// `packet`のペイロードを追加し、完成したセクションごとに`on_section`を呼ぶ。
    ///
    /// ポインターフィールドを考慮し、連続性指標が途切れた場合は組み立て中のセクションを捨てる。
    pub fn push<F: FnMut(&[u8])>(&mut self, packet: &Packet, mut on_section: F) {
        if !packet.validate_cc(&mut self.last_cc) {
            log::debug!("section cc discontinuity: {:?}", packet.pid());
            self.buffer.clear();
            self.synced = false;
        }
        let Some(payload) = packet.payload() else {
            return;
        };

        if packet.unit_start_indicator() {
            let Some((&pointer, rest)) = payload.split_first() else {
                return;
            };
            let Some((tail, head)) = (pointer as usize <= rest.len()).then(|| rest.split_at(pointer as usize)) else {
                log::debug!("invalid pointer field: {}", pointer);
                self.buffer.clear();
                self.synced = false;
                return;
            };

            if self.synced {
                self.extend(tail, &mut on_section);
            }
            self.buffer.clear();
            self.synced = true;
            self.extend(head, &mut on_section);
        } else if self.synced {
            self.extend(payload, &mut on_section);
        }
    }

    fn extend<F: FnMut(&[u8])>(&mut self, data: &[u8], on_section: &mut F) {
        let len = std::cmp::min(self.buffer.remaining_capacity(), data.len());
        let _result = self.buffer.try_extend_from_slice(&data[..len]);
        debug_assert!(_result.is_ok());

        let mut buf = self.buffer.as_slice();
        loop {
            // 0xFFはスタッフィング
            if buf.first().map_or(true, |&table_id| table_id == 0xFF) {
                buf = &[];
                break;
            }
            if buf.len() < 3 {
                break;
            }
            let section_len = (buf[1..=2].read_be_16() & 0x0FFF) as usize + 3;
            if buf.len() < section_len {
                break;
            }

            on_section(&buf[..section_len]);
            buf = &buf[section_len..];
        }

        if buf.len() < self.buffer.len() {
            // 処理した部分を捨てる
            let remaining = buf.len();
            let offset = self.buffer.len() - remaining;
            self.buffer.copy_within(offset.., 0);
            self.buffer.truncate(remaining);
        }
    }
}

impl Default for SectionAssembler {
    fn default() -> Self {
        SectionAssembler::new()
    }
}

impl std::fmt::Debug for SectionAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SectionAssembler")
            .field("buffered", &self.buffer.len())
            .field("synced", &self.synced)
            .finish()
    }
}
