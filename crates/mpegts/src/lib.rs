//! MPEG2-TSとPESを相互に変換するためのクレート。
//!
//! 188バイトのTSパケット、PID、PESヘッダ、セクションフィルターに加え、
//! 録画経路向けのPES→TS変換と再生経路向けのTS→PES再パケット化を提供する。

#![deny(missing_docs)]

pub mod p2t;
pub mod packet;
pub mod pes;
pub mod pid;
pub mod repack;
pub mod section;
mod utils;

pub use p2t::{clear_video_length, p_to_t, write_ts_header, PesToTs, RecordPacketizer};
pub use packet::Packet;
pub use pes::{find_pes_header, StreamId};
pub use pid::{Pid, PidTable};
pub use repack::{PesRepacker, TsToPes};
pub use section::{SectionAssembler, SectionFilter};
