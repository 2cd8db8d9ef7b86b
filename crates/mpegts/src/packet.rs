//! 188バイトのTSパケット（セル）。

use std::fmt;
use std::io::{self, Read};

use crate::pid::Pid;

/// 同期バイト。
pub const SYNC_BYTE: u8 = 0x47;
/// TSパケットの長さ。
pub const PACKET_SIZE: usize = 188;
/// TSヘッダの長さ。
pub const HEADER_SIZE: usize = 4;
/// アダプテーションフィールドが無い場合のペイロード長。
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE;

/// MPEG2-TSのパケット。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Packet(pub [u8; PACKET_SIZE]);

impl Packet {
    /// `data`の先頭188バイトを複製して`Packet`を生成する。
    ///
    /// 長さが足りないか同期バイトが無い場合は`None`を返す。
    #[inline]
    pub fn from_bytes(data: &[u8]) -> Option<Packet> {
        let cell: [u8; PACKET_SIZE] = data.get(..PACKET_SIZE)?.try_into().ok()?;
        (cell[0] == SYNC_BYTE).then_some(Packet(cell))
    }

    /// `r`からTSパケットを順次読み込むイテレーターを生成する。
    #[inline]
    #[must_use]
    pub fn iter<R: Read>(r: R) -> PacketIter<R> {
        PacketIter { r }
    }

    /// `r`からTSパケットを読み込む。
    ///
    /// 先頭が同期バイトでない場合、次の同期バイトまで読み飛ばしてから188バイトを揃える。
    /// 終端に達した場合は`Ok(None)`を返す。
    pub fn read<R: Read>(mut r: R) -> io::Result<Option<Packet>> {
        let mut packet = Packet([0; PACKET_SIZE]);
        let mut filled = 0;
        loop {
            match r.read(&mut packet.0[filled..]) {
                Ok(0) => return Ok(None),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }

            match memchr::memchr(SYNC_BYTE, &packet.0[..filled]) {
                None => filled = 0,
                Some(0) => {}
                Some(pos) => {
                    log::trace!("resync: skipped {} bytes", pos);
                    packet.0.copy_within(pos..filled, 0);
                    filled -= pos;
                }
            }
            if filled == PACKET_SIZE {
                return Ok(Some(packet));
            }
        }
    }

    /// パケットが正常かどうかを返す。
    ///
    /// 同期バイト、トランスポートエラーインジケーター、アダプテーションフィールド長を確認する。
    pub fn is_normal(&self) -> bool {
        if self.sync_byte() != SYNC_BYTE || self.error_indicator() {
            return false;
        }
        match self.adaptation_field_control() {
            0b00 => false,
            0b10 => self.0[4] as usize <= PAYLOAD_SIZE - 1,
            0b11 => (self.0[4] as usize) < PAYLOAD_SIZE - 1,
            _ => true,
        }
    }

    /// 同期バイトを返す。
    #[inline]
    pub fn sync_byte(&self) -> u8 {
        self.0[0]
    }

    /// トランスポートエラーインジケーターを返す。
    #[inline]
    pub fn error_indicator(&self) -> bool {
        self.0[1] & 0x80 != 0
    }

    /// ペイロードユニット開始インジケーターを返す。
    #[inline]
    pub fn unit_start_indicator(&self) -> bool {
        self.0[1] & 0x40 != 0
    }

    /// PIDを返す。
    #[inline]
    pub fn pid(&self) -> Pid {
        Pid::read(&self.0[1..])
    }

    /// トランスポートスクランブル制御（2ビット）を返す。
    #[inline]
    pub fn scrambling_control(&self) -> u8 {
        (self.0[3] & 0xC0) >> 6
    }

    /// アダプテーションフィールド制御（2ビット）を返す。
    #[inline]
    pub fn adaptation_field_control(&self) -> u8 {
        (self.0[3] & 0x30) >> 4
    }

    /// 連続性指標（4ビット）を返す。
    #[inline]
    pub fn continuity_counter(&self) -> u8 {
        self.0[3] & 0x0F
    }

    /// パケットがアダプテーションフィールドを含むかどうかを返す。
    #[inline]
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control() & 0b10 != 0
    }

    /// アダプテーションフィールドがある場合、adaptation_field_lengthを返す。
    #[inline]
    pub fn adaptation_field_length(&self) -> Option<u8> {
        self.has_adaptation_field().then(|| self.0[4])
    }

    /// 不連続性インジケーターを返す。
    ///
    /// アダプテーションフィールドが無いか空の場合は`false`。
    pub fn discontinuity_indicator(&self) -> bool {
        matches!(self.adaptation_field_length(), Some(len) if len >= 1 && self.0[5] & 0x80 != 0)
    }

    /// パケットがペイロードを含むかどうかを返す。
    #[inline]
    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control() & 0b01 != 0
    }

    /// ペイロードを返す。
    pub fn payload(&self) -> Option<&[u8]> {
        if !self.has_payload() {
            None
        } else if let Some(afl) = self.adaptation_field_length() {
            self.0.get(HEADER_SIZE + 1 + afl as usize..)
        } else {
            Some(&self.0[HEADER_SIZE..])
        }
    }

    /// 前回の連続性指標である`last_cc`を元にパケット順の正当性を確認する。
    ///
    /// `last_cc`の初期値は`0x10`以上とする。
    pub fn validate_cc(&self, last_cc: &mut u8) -> bool {
        let cc = if self.has_payload() {
            self.continuity_counter()
        } else {
            0x10
        };
        let cc_ok = self.pid() == Pid::NULL
            || self.discontinuity_indicator()
            || cc >= 0x10
            || *last_cc >= 0x10
            || (*last_cc + 1) & 0x0F == cc;
        *last_cc = cc;

        cc_ok
    }
}

impl AsRef<[u8]> for Packet {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("error_indicator", &self.error_indicator())
            .field("unit_start_indicator", &self.unit_start_indicator())
            .field("pid", &self.pid())
            .field("adaptation_field_control", &self.adaptation_field_control())
            .field("continuity_counter", &self.continuity_counter())
            .finish_non_exhaustive()
    }
}

/// [`Packet::iter`]から返される。TSパケットを順次読み込むイテレーター。
#[derive(Debug)]
pub struct PacketIter<R> {
    r: R,
}

impl<R: Read> Iterator for PacketIter<R> {
    type Item = io::Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        Packet::read(&mut self.r).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn cell(header: &[u8]) -> Packet {
        let mut packet = Packet([0xFF; PACKET_SIZE]);
        packet.0[..header.len()].copy_from_slice(header);
        packet
    }

    #[test]
    fn test_packet_accessor() {
        let packet = cell(&hex_literal::hex!("47 41 00 15"));
        assert!(packet.is_normal());
        assert!(packet.unit_start_indicator());
        assert!(!packet.error_indicator());
        assert_eq!(packet.pid(), Pid::new(0x0100));
        assert_eq!(packet.continuity_counter(), 5);
        assert_eq!(packet.adaptation_field_length(), None);
        assert_eq!(packet.payload().map(<[u8]>::len), Some(PAYLOAD_SIZE));

        let packet = cell(&hex_literal::hex!("47 01 00 33 05 80"));
        assert!(packet.is_normal());
        assert!(!packet.unit_start_indicator());
        assert_eq!(packet.adaptation_field_length(), Some(5));
        assert!(packet.discontinuity_indicator());
        assert_eq!(packet.payload(), Some(&packet.0[10..]));

        let packet = cell(&hex_literal::hex!("47 01 00 20 B7 00"));
        assert!(packet.is_normal());
        assert_eq!(packet.payload(), None);
    }

    #[test]
    fn test_packet_abnormal() {
        assert!(!cell(&[0x00]).is_normal());
        assert!(!cell(&[SYNC_BYTE, 0x80, 0x00, 0x10]).is_normal());
        assert!(!cell(&[SYNC_BYTE, 0x00, 0x00, 0x00]).is_normal());
        assert!(!cell(&[SYNC_BYTE, 0x00, 0x00, 0x20, 184]).is_normal());
        assert!(!cell(&[SYNC_BYTE, 0x00, 0x00, 0x30, 183]).is_normal());
    }

    #[test]
    fn test_packet_from_bytes() {
        let packet = cell(&[SYNC_BYTE, 0x00, 0x11, 0x10]);
        assert_eq!(Packet::from_bytes(&packet.0), Some(packet.clone()));
        assert_eq!(Packet::from_bytes(&packet.0[..PACKET_SIZE - 1]), None);
        assert_eq!(Packet::from_bytes(&[0; PACKET_SIZE]), None);
    }

    #[test]
    fn test_packet_read() {
        let p1 = cell(&[SYNC_BYTE, 0x41, 0x00, 0x10]);
        let p2 = cell(&[SYNC_BYTE, 0x01, 0x00, 0x11]);

        let data = [&[0x00, 0x12, 0x34][..], &p1.0, &p2.0, &[SYNC_BYTE, 0x01]].concat();
        let mut iter = Packet::iter(&*data);
        assert_eq!(iter.next().unwrap().unwrap(), p1);
        assert_eq!(iter.next().unwrap().unwrap(), p2);
        assert_matches!(iter.next(), None);

        assert_eq!(Packet::read(&mut &[][..]).unwrap(), None);
    }

    #[test]
    fn test_packet_read_err() {
        struct ReadErr(io::ErrorKind);
        impl Read for ReadErr {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(self.0.into())
            }
        }

        assert_matches!(
            Packet::read(ReadErr(io::ErrorKind::UnexpectedEof)),
            Ok(None)
        );
        assert_matches!(
            Packet::read(ReadErr(io::ErrorKind::BrokenPipe)),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn test_validate_cc() {
        let mut last_cc = 0x10;
        for cc in [0x0E, 0x0F, 0x00, 0x01] {
            let packet = cell(&[SYNC_BYTE, 0x01, 0x00, 0x10 | cc]);
            assert!(packet.validate_cc(&mut last_cc));
        }
        let packet = cell(&[SYNC_BYTE, 0x01, 0x00, 0x13]);
        assert!(!packet.validate_cc(&mut last_cc));
    }
}
