//! コプロセッサを搭載したDVBカードを制御するためのクレート。
//!
//! ホストとコプロセッサは共有メモリ上のレジスタでコマンドを交わし、
//! コプロセッサからの通知はメールボックス割り込みで届く。
//! 割り込みの処理は[`MailboxDispatcher`]が、届いたデータの振り分けは[`StreamRouter`]が担う。

#![deny(missing_docs)]

pub mod bitmap;
pub mod boot;
pub mod card;
pub mod ci;
pub mod clock;
pub mod command;
pub mod config;
pub mod demux;
pub mod error;
pub mod hw;
pub mod ir;
pub mod mailbox;
pub mod playback;
pub mod ring_buf;
pub mod router;
pub mod stream;
pub mod watchdog;

#[cfg(test)]
mod sim;

pub use card::{Attached, Card};
pub use command::{Command, CommandChannel, CommandType, FirmwareVersion};
pub use config::{CardClass, CardConfig, Timeouts};
pub use demux::{DemuxEngine, FeedHandle, FeedKind, FeedSink, Source};
pub use error::{Error, Phase, Result};
pub use mailbox::{Delivery, MailboxDispatcher};
pub use ring_buf::RingBuffer;
pub use router::StreamRouter;
pub use stream::{Mode, StreamStateMachine};
pub use watchdog::{Watchdog, WatchdogHandle};
