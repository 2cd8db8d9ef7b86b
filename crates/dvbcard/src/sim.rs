//! テスト用のハードウェアの代替。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::card::{Attached, Card};
use crate::clock::Clock;
use crate::command::FirmwareVersion;
use crate::config::CardConfig;
use crate::hw::{self, Bridge, Dpram, IrqLine};
use crate::ir::DeviceId;

const MEM_SIZE: usize = 0x2000;

/// 待機すると仮想時間だけが進む時計。
#[derive(Debug)]
pub(crate) struct FakeClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl FakeClock {
    pub fn new() -> FakeClock {
        FakeClock {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }
}

/// コプロセッサが受け取ったコマンド。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeCommand {
    pub word: u16,
    pub args: Vec<u16>,
}

impl FakeCommand {
    pub fn opcode_word(&self) -> u16 {
        self.word
    }
}

/// 割り当て済みのハードウェアフィルター。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeFilter {
    pub handle: u16,
    pub pid: u16,
    pub mode: u16,
    pub words: Vec<u16>,
}

struct State {
    mem: Box<[u8]>,
    commands: Vec<FakeCommand>,
    hang: bool,
    handshake_busy: bool,
    msgstate: u16,
    loops: u16,
    version: FirmwareVersion,
    filter_slots: u16,
    filters: Vec<FakeFilter>,
    echo_mismatch: bool,
    interface_lock_writes: usize,
    acks: usize,
    in_reset: bool,
    boot_stall: bool,
    boot_block: u32,
    image: Vec<u8>,
    boots: usize,
}

impl State {
    fn index(addr: u32) -> Option<usize> {
        let offset = addr.checked_sub(hw::DPRAM_BASE)? as usize;
        (offset + 1 < MEM_SIZE).then_some(offset)
    }

    fn word(&self, addr: u32) -> u16 {
        State::index(addr).map_or(0, |i| u16::from_le_bytes([self.mem[i], self.mem[i + 1]]))
    }

    fn set_word(&mut self, addr: u32, value: u16) {
        if let Some(i) = State::index(addr) {
            self.mem[i..i + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn execute(&mut self) {
        let word = self.word(hw::COMMAND);
        let len = self.word(hw::COM_BUFF + 2) as usize;
        let args: Vec<u16> = (0..len)
            .map(|i| self.word(hw::COM_BUFF + 4 + 2 * i as u32))
            .collect();

        let reply: Vec<u16> = match word {
            // ReqVersion
            0x0706 => {
                let v = self.version;
                let mut reply = Vec::new();
                for dword in [v.firmware, v.rtsl, v.video, v.app] {
                    reply.extend([(dword >> 16) as u16, dword as u16]);
                }
                reply.resize(16, 0);
                reply
            }
            // AddPIDFilter
            0x0B07 => {
                let handle = (0..self.filter_slots)
                    .find(|h| self.filters.iter().all(|f| f.handle != *h))
                    .unwrap_or(0xFFFF);
                if handle != 0xFFFF {
                    self.filters.push(FakeFilter {
                        handle,
                        pid: args[0],
                        mode: args[1],
                        words: args[2..].to_vec(),
                    });
                }
                vec![handle]
            }
            // DelPIDFilter
            0x0B08 => {
                let handle = args[0];
                self.filters.retain(|f| f.handle != handle);
                let echoed = if self.echo_mismatch { handle ^ 1 } else { handle };
                vec![0, echoed]
            }
            _ => Vec::new(),
        };
        for (i, &w) in reply.iter().enumerate() {
            self.set_word(hw::COM_BUFF + 2 * i as u32, w);
        }

        self.commands.push(FakeCommand { word, args });
        self.set_word(hw::COMMAND, 0);
    }

    fn on_boot_state(&mut self, value: u16) {
        if self.in_reset || value != hw::BOOTSTATE_BUFFER_FULL {
            return;
        }
        let size = self.word(hw::BOOT_SIZE) as usize;
        if size == 0 {
            self.set_word(hw::BOOT_STATE, hw::BOOTSTATE_BOOT_COMPLETE);
            self.boots += 1;
            return;
        }
        if let Some(i) = State::index(self.boot_block) {
            let block = self.mem[i..i + size].to_vec();
            self.image.extend_from_slice(&block);
        }
        if !self.boot_stall {
            self.set_word(hw::BOOT_STATE, hw::BOOTSTATE_BUFFER_EMPTY);
        }
    }
}

/// コマンドを即座に処理するコプロセッサ。
pub(crate) struct FakeCoprocessor {
    state: Mutex<State>,
}

impl FakeCoprocessor {
    pub fn new() -> FakeCoprocessor {
        let mut state = State {
            mem: vec![0; MEM_SIZE].into_boxed_slice(),
            commands: Vec::new(),
            hang: false,
            handshake_busy: false,
            msgstate: 0,
            loops: 1,
            version: FirmwareVersion {
                firmware: 0x0000_2623,
                rtsl: 0x0000_2623,
                video: 0x0000_0001,
                app: 0x0000_2623,
            },
            filter_slots: 32,
            filters: Vec::new(),
            echo_mismatch: false,
            interface_lock_writes: 0,
            acks: 0,
            in_reset: false,
            boot_stall: false,
            boot_block: hw::BOOT_BLOCK,
            image: Vec::new(),
            boots: 0,
        };
        state.set_word(hw::BOOT_STATE, hw::BOOTSTATE_BOOT_COMPLETE);
        FakeCoprocessor {
            state: Mutex::new(state),
        }
    }

    pub fn commands(&self) -> Vec<FakeCommand> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// 受け取ったコマンドのうち、指定の1ワード目を持つものの引数を返す。
    pub fn commands_of(&self, word: u16) -> Vec<Vec<u16>> {
        let state = self.state.lock();
        state
            .commands
            .iter()
            .filter(|c| c.word == word)
            .map(|c| c.args.clone())
            .collect()
    }

    /// コマンドの処理を止める。解除すると止めていたコマンドを処理する。
    pub fn set_hang(&self, hang: bool) {
        let mut state = self.state.lock();
        state.hang = hang;
        if !hang && state.word(hw::COMMAND) != 0 {
            state.execute();
        }
    }

    pub fn set_handshake_busy(&self, busy: bool) {
        self.state.lock().handshake_busy = busy;
    }

    pub fn set_msgstate(&self, msgstate: u16) {
        self.state.lock().msgstate = msgstate;
    }

    pub fn set_filter_slots(&self, slots: u16) {
        self.state.lock().filter_slots = slots;
    }

    pub fn set_echo_mismatch(&self, mismatch: bool) {
        self.state.lock().echo_mismatch = mismatch;
    }

    pub fn set_boot_stall(&self, stall: bool) {
        self.state.lock().boot_stall = stall;
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.state.lock().version
    }

    pub fn filters(&self) -> Vec<FakeFilter> {
        self.state.lock().filters.clone()
    }

    pub fn interface_lock_writes(&self) -> usize {
        self.state.lock().interface_lock_writes
    }

    pub fn advance_loops(&self) {
        let mut state = self.state.lock();
        state.loops = state.loops.wrapping_add(1);
    }

    pub fn acks(&self) -> usize {
        self.state.lock().acks
    }

    pub fn image(&self) -> Vec<u8> {
        self.state.lock().image.clone()
    }

    pub fn boots(&self) -> usize {
        self.state.lock().boots
    }

    pub fn word(&self, addr: u32) -> u16 {
        self.state.lock().word(addr)
    }

    pub fn put_word(&self, addr: u32, value: u16) {
        self.state.lock().set_word(addr, value);
    }

    pub fn bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read_block(addr, &mut buf);
        buf
    }

    pub fn put_bytes(&self, addr: u32, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(i) = State::index(addr) {
            state.mem[i..i + data.len()].copy_from_slice(data);
        }
    }

    /// ホストへメッセージを通知する。
    pub fn raise(&self, ty: u16, len: u16, rx_buff: u16) {
        let mut state = self.state.lock();
        state.set_word(hw::IRQ_STATE, ty);
        state.set_word(hw::IRQ_STATE_EXT, len);
        state.set_word(hw::RX_BUFF, rx_buff);
        state.set_word(hw::IRQ_RX, 1);
    }

    fn on_reset(&self, asserted: bool) {
        let mut state = self.state.lock();
        state.in_reset = asserted;
        if asserted {
            state.image.clear();
            state.filters.clear();
        } else {
            state.set_word(hw::BOOT_STATE, hw::BOOTSTATE_BUFFER_EMPTY);
            state.set_word(hw::COMMAND, 0);
            state.set_word(hw::HANDSHAKE_REG, 0);
        }
    }
}

impl Dpram for FakeCoprocessor {
    fn read_word(&self, addr: u32) -> u16 {
        let state = self.state.lock();
        match addr {
            hw::HANDSHAKE_REG if state.handshake_busy => 1,
            hw::MSGSTATE => state.msgstate,
            hw::STATUS_LOOPS => state.loops,
            _ => state.word(addr),
        }
    }

    fn write_word(&self, addr: u32, value: u16) {
        let mut state = self.state.lock();
        state.set_word(addr, value);
        match addr {
            hw::COMMAND if value != 0 && !state.hang => state.execute(),
            hw::COMMAND if value != 0 => {
                let len = state.word(hw::COM_BUFF + 2) as usize;
                let args = (0..len)
                    .map(|i| state.word(hw::COM_BUFF + 4 + 2 * i as u32))
                    .collect();
                state.commands.push(FakeCommand { word: value, args });
            }
            hw::COM_IF_LOCK => state.interface_lock_writes += 1,
            hw::IRQ_RX if value == 0 => state.acks += 1,
            hw::BOOT_STATE => state.on_boot_state(value),
            _ => {}
        }
    }

    fn read_block(&self, addr: u32, buf: &mut [u8]) {
        let state = self.state.lock();
        if let Some(i) = State::index(addr) {
            let len = buf.len().min(MEM_SIZE - i);
            buf[..len].copy_from_slice(&state.mem[i..i + len]);
        }
    }

    fn write_block(&self, addr: u32, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(i) = State::index(addr) {
            let len = data.len().min(MEM_SIZE - i);
            state.mem[i..i + len].copy_from_slice(&data[..len]);
        }
        if (hw::BOOT_BLOCK..hw::RESERVED).contains(&addr) {
            state.boot_block = addr;
        }
    }
}

/// ブリッジで開始された転送。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transfer {
    Read { addr: u32, len: usize },
    Write { addr: u32, data: Vec<u8> },
}

/// 割り込みと転送を記録するブリッジ。
pub(crate) struct FakeBridge {
    coproc: Arc<FakeCoprocessor>,
    irqs: Mutex<Vec<(IrqLine, bool)>>,
    transfers: Mutex<Vec<Transfer>>,
}

impl FakeBridge {
    pub fn new(coproc: Arc<FakeCoprocessor>) -> FakeBridge {
        FakeBridge {
            coproc,
            irqs: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
        }
    }

    pub fn irq_enabled(&self, line: IrqLine) -> bool {
        self.irqs
            .lock()
            .iter()
            .rev()
            .find(|(l, _)| *l == line)
            .map_or(false, |(_, enabled)| *enabled)
    }

    pub fn take_transfers(&self) -> Vec<Transfer> {
        std::mem::take(&mut *self.transfers.lock())
    }

    /// 開始された読み込み転送を実行し、読み込んだデータを返す。
    pub fn complete_read(&self) -> Option<Vec<u8>> {
        let mut transfers = self.transfers.lock();
        let pos = transfers
            .iter()
            .position(|t| matches!(t, Transfer::Read { .. }))?;
        match transfers.remove(pos) {
            Transfer::Read { addr, len } => Some(self.coproc.bytes(addr, len)),
            Transfer::Write { .. } => None,
        }
    }
}

impl Bridge for FakeBridge {
    fn set_irq_enabled(&self, line: IrqLine, enabled: bool) {
        self.irqs.lock().push((line, enabled));
    }

    fn start_read(&self, addr: u32, len: usize) {
        self.transfers.lock().push(Transfer::Read { addr, len });
    }

    fn start_write(&self, addr: u32, data: &[u8]) {
        self.coproc.write_block(addr, data);
        self.transfers.lock().push(Transfer::Write {
            addr,
            data: data.to_vec(),
        });
    }

    fn set_coprocessor_reset(&self, asserted: bool) {
        self.coproc.on_reset(asserted);
    }
}

/// テスト用のファームウェア。
pub(crate) const FIRMWARE: &[u8] = &[0xA5; hw::BOOT_MAX_SIZE + 0x100];

/// 代替ハードウェアの上にカードを構成する。
pub(crate) fn card(config: CardConfig) -> (Attached, Arc<FakeCoprocessor>, Arc<FakeBridge>) {
    let coproc = Arc::new(FakeCoprocessor::new());
    let bridge = Arc::new(FakeBridge::new(coproc.clone()));
    let attached = Card::attach(
        config,
        coproc.clone(),
        bridge.clone(),
        Arc::new(FakeClock::new()),
        FIRMWARE,
        DeviceId(0),
    );
    (attached, coproc, bridge)
}
