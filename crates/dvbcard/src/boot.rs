//! コプロセッサの起動。

use crate::clock::{poll_until, Clock};
use crate::config::Timeouts;
use crate::error::{Error, Phase, Result};
use crate::hw::{self, Bridge, Dpram, IrqLine};

fn wait_boot_state(dpram: &dyn Dpram, clock: &dyn Clock, timeouts: &Timeouts, state: u16) -> Result<()> {
    poll_until(
        clock,
        timeouts.boot_block,
        timeouts.poll_interval,
        Phase::Boot,
        || dpram.read_word(hw::BOOT_STATE) == state,
    )
}

/// コプロセッサをリセットし、`image`を読み込ませて起動する。
///
/// `image`は最大0xC00バイトのブロックに分割され、2つのブロック領域へ交互に書き込まれる。
/// ブロックごとにブートローダーが領域を空けるのを待ち、最後に長さ0のブロックを送って
/// 起動の完了を待つ。
pub fn load_firmware(
    dpram: &dyn Dpram,
    bridge: &dyn Bridge,
    clock: &dyn Clock,
    timeouts: &Timeouts,
    image: &[u8],
) -> Result<()> {
    if image.is_empty() || image.len() > hw::DRAM_MAX_CODE_SIZE {
        return Err(Error::InvalidArgument("firmware image size"));
    }

    bridge.set_irq_enabled(IrqLine::Mailbox, false);
    bridge.set_coprocessor_reset(true);
    dpram.write_word(hw::BOOT_STATE, hw::BOOTSTATE_BUFFER_FULL);
    bridge.set_coprocessor_reset(false);

    let mut block_addr = hw::BOOT_BLOCK;
    let mut base = hw::DRAM_START_CODE;
    for (i, block) in image.chunks(hw::BOOT_MAX_SIZE).enumerate() {
        if let Err(e) = wait_boot_state(dpram, clock, timeouts, hw::BOOTSTATE_BUFFER_EMPTY) {
            log::warn!("load_firmware: timeout at block {}", i);
            return Err(e);
        }
        log::trace!("writing firmware block {} ({} bytes)", i, block.len());

        dpram.write_block(block_addr, block);
        block_addr ^= hw::BOOT_BLOCK_TOGGLE;
        dpram.write_word(hw::BOOT_BASE, (base >> 16) as u16);
        dpram.write_word(hw::BOOT_BASE + 2, base as u16);
        dpram.write_word(hw::BOOT_SIZE, block.len() as u16);
        dpram.write_word(hw::BOOT_STATE, hw::BOOTSTATE_BUFFER_FULL);
        base += block.len() as u32;
    }

    if let Err(e) = wait_boot_state(dpram, clock, timeouts, hw::BOOTSTATE_BUFFER_EMPTY) {
        log::warn!("load_firmware: timeout after last block");
        return Err(e);
    }
    dpram.write_word(hw::BOOT_SIZE, 0);
    dpram.write_word(hw::BOOT_STATE, hw::BOOTSTATE_BUFFER_FULL);
    if let Err(e) = wait_boot_state(dpram, clock, timeouts, hw::BOOTSTATE_BOOT_COMPLETE) {
        log::warn!("load_firmware: final handshake timeout");
        return Err(e);
    }

    // メールボックスを空にしてから割り込みを受け付ける
    dpram.write_word(hw::IRQ_RX, 0);
    dpram.write_word(hw::IRQ_TX, 0);
    bridge.set_irq_enabled(IrqLine::Mailbox, true);
    log::debug!("coprocessor booted ({} bytes)", image.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FakeBridge, FakeClock, FakeCoprocessor};
    use std::sync::Arc;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_load_firmware() {
        let coproc = Arc::new(FakeCoprocessor::new());
        let bridge = FakeBridge::new(coproc.clone());
        let clock = FakeClock::new();

        let image = image(hw::BOOT_MAX_SIZE * 2 + 100);
        load_firmware(&*coproc, &bridge, &clock, &Timeouts::DEFAULT, &image).unwrap();
        assert_eq!(coproc.image(), image);
        assert_eq!(coproc.boots(), 1);
        assert_eq!(coproc.word(hw::BOOT_SIZE), 0);
        assert!(bridge.irq_enabled(IrqLine::Mailbox));
    }

    #[test]
    fn test_load_firmware_timeout() {
        let coproc = Arc::new(FakeCoprocessor::new());
        let bridge = FakeBridge::new(coproc.clone());
        let clock = FakeClock::new();
        coproc.set_boot_stall(true);

        let image = image(hw::BOOT_MAX_SIZE + 1);
        assert_eq!(
            load_firmware(&*coproc, &bridge, &clock, &Timeouts::DEFAULT, &image),
            Err(Error::Timeout(Phase::Boot))
        );
        // 最初のブロックだけが受け取られた
        assert_eq!(coproc.image(), image[..hw::BOOT_MAX_SIZE]);
        assert!(clock.elapsed() >= Timeouts::DEFAULT.boot_block);
        assert!(!bridge.irq_enabled(IrqLine::Mailbox));
    }

    #[test]
    fn test_load_firmware_invalid() {
        let coproc = Arc::new(FakeCoprocessor::new());
        let bridge = FakeBridge::new(coproc.clone());
        assert_eq!(
            load_firmware(&*coproc, &bridge, &FakeClock::new(), &Timeouts::DEFAULT, &[]),
            Err(Error::InvalidArgument("firmware image size"))
        );
    }
}
