//! 割り込みから届いたデータをフィードやCIへ振り分ける。

use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::ci::CiInterface;
use crate::demux::DemuxEngine;
use crate::mailbox::Delivery;

/// [`MailboxDispatcher`](crate::mailbox::MailboxDispatcher)から受け取ったデータを処理する。
///
/// 割り込みの文脈の外で動き、フィードの処理関数はここから呼ばれる。
#[derive(Debug)]
pub struct StreamRouter {
    rx: Receiver<Delivery>,
    demux: Arc<DemuxEngine>,
    ci: Arc<CiInterface>,
}

impl StreamRouter {
    pub(crate) fn new(rx: Receiver<Delivery>, demux: Arc<DemuxEngine>, ci: Arc<CiInterface>) -> StreamRouter {
        StreamRouter { rx, demux, ci }
    }

    /// 届いているデータをすべて処理し、処理した数を返す。待機はしない。
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            self.route(delivery);
            count += 1;
        }
        count
    }

    /// 送信側がすべて破棄されるまでデータを処理し続ける。
    pub fn run(mut self) {
        while let Ok(delivery) = self.rx.recv() {
            self.route(delivery);
        }
        log::debug!("stream router finished");
    }

    /// 新しいスレッドで[`run`](StreamRouter::run)を開始する。
    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }

    fn route(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::TsRecord(data) => {
                if let Err(e) = self.demux.sw_filter_packets(&data, true) {
                    log::debug!("ts record dropped: {}", e);
                }
            }
            Delivery::PesRecord { class, mut data } => self.demux.on_pes_record(class, &mut data),
            Delivery::Filtered { handle, data, .. } => self.demux.on_filtered(handle, &data),
            Delivery::CiGet(data) => {
                if !self.ci.update_slot_status(&data) {
                    self.ci.push_read(&data);
                }
            }
        }
    }
}
