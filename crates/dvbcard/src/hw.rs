//! ハードウェアとの境界。
//!
//! コプロセッサとは共有メモリ（DPRAM）上の固定レジスタを通じてやり取りする。
//! レジスタのアドレスはバスアドレスであり、値はすべて16ビットのワードである。

/// DPRAMの先頭アドレス。
pub const DPRAM_BASE: u32 = 0x4000;

/// ブートローダーの状態。
pub const BOOT_STATE: u32 = DPRAM_BASE + 0x3F8;
/// 転送するブロックの長さ。
pub const BOOT_SIZE: u32 = DPRAM_BASE + 0x3FA;
/// 転送するブロックの書き込み先（上位・下位の2ワード）。
pub const BOOT_BASE: u32 = DPRAM_BASE + 0x3FC;
/// ブロックを置く領域。
pub const BOOT_BLOCK: u32 = DPRAM_BASE + 0x400;
/// ブロックの最大長。
pub const BOOT_MAX_SIZE: usize = 0xC00;
/// ブロック領域を切り替えるための値。
pub const BOOT_BLOCK_TOGGLE: u32 = 0x1400;
/// ファームウェアを展開するアドレス。
pub const DRAM_START_CODE: u32 = 0x2E00_0404;
/// ファームウェアの最大長。
pub const DRAM_MAX_CODE_SIZE: usize = 0x0010_0000;

/// 受信したメッセージの種類。
pub const IRQ_STATE: u32 = DPRAM_BASE + 0x0F4;
/// 受信したメッセージの長さ。
pub const IRQ_STATE_EXT: u32 = DPRAM_BASE + 0x0F6;
/// キューの状態。
pub const MSGSTATE: u32 = DPRAM_BASE + 0x0F8;
/// コマンドの種類と命令。
pub const COMMAND: u32 = DPRAM_BASE + 0x0FC;
/// コマンドの引数と応答。
pub const COM_BUFF: u32 = DPRAM_BASE + 0x100;
/// コマンドバッファのワード数。
pub const COM_BUFF_WORDS: usize = 0x20 / 2;

/// デバッグ文字列やIRコードが置かれる領域。
pub const RESERVED: u32 = DPRAM_BASE + 0x1E00;
/// デバッグ文字列の領域の長さ。
pub const RESERVED_SIZE: usize = 0x1C0;

/// コプロセッサのメインループの周回数。
pub const STATUS_LOOPS: u32 = DPRAM_BASE + 0x1FC0 + 0x08;

/// 送信データの長さ。
pub const TX_LEN: u32 = DPRAM_BASE + 0x1FEE;
/// 受信データのオフセット。
pub const RX_BUFF: u32 = DPRAM_BASE + 0x1FF4;
/// 送信データのオフセット。
pub const TX_BUFF: u32 = DPRAM_BASE + 0x1FF6;
/// ハンドシェイクレジスタ。
pub const HANDSHAKE_REG: u32 = DPRAM_BASE + 0x1FF8;
/// 古いファームウェア向けのインターフェースロック。
pub const COM_IF_LOCK: u32 = DPRAM_BASE + 0x1FFA;
/// メールボックスの受信通知。0を書き込むと応答となる。
pub const IRQ_RX: u32 = DPRAM_BASE + 0x1FFC;
/// メールボックスの送信通知。
pub const IRQ_TX: u32 = DPRAM_BASE + 0x1FFE;

/// ブートローダーがブロックを受け付けられる。
pub const BOOTSTATE_BUFFER_EMPTY: u16 = 0;
/// ブロックを書き込んだ。
pub const BOOTSTATE_BUFFER_FULL: u16 = 1;
/// ファームウェアの起動が完了した。
pub const BOOTSTATE_BOOT_COMPLETE: u16 = 2;

/// `MSGSTATE`のビット。
pub mod msgstate {
    /// OSDキューに空きが無い。
    pub const OSDQ_FULL: u16 = 0x0001;
    /// 汎用キューに空きが無い。
    pub const GPMQ_FULL: u16 = 0x0002;
    /// 汎用キューが溢れた。
    pub const GPMQ_OVER: u16 = 0x0020;
    /// OSDキューが溢れた。
    pub const OSDQ_OVER: u16 = 0x0040;
}

/// 一度に転送するデータの最大長。
pub const MAX_TRANSFER: usize = 0x2000;

/// 割り込みの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqLine {
    /// コプロセッサからのメールボックス通知。
    Mailbox,
    /// ブリッジの転送完了通知。
    TransferDone,
}

/// コプロセッサと共有するDPRAM。
///
/// 割り込みと通常の処理の両方から呼ばれるため、実装は内部で排他する必要がある。
pub trait Dpram: Send + Sync {
    /// `addr`のワードを読み込む。
    fn read_word(&self, addr: u32) -> u16;

    /// `addr`にワードを書き込む。
    fn write_word(&self, addr: u32, value: u16);

    /// `addr`から`buf`の長さだけ読み込む。
    fn read_block(&self, addr: u32, buf: &mut [u8]);

    /// `addr`から`data`を書き込む。
    fn write_block(&self, addr: u32, data: &[u8]);
}

/// PCIブリッジ。
///
/// 転送を開始した後、完了すると[`MailboxDispatcher::on_transfer_done`]が呼ばれる。
///
/// [`MailboxDispatcher::on_transfer_done`]: crate::mailbox::MailboxDispatcher::on_transfer_done
pub trait Bridge: Send + Sync {
    /// 割り込みの有効・無効を切り替える。
    fn set_irq_enabled(&self, line: IrqLine, enabled: bool);

    /// DPRAMの`addr`から`len`バイトを読み込む転送を開始する。
    fn start_read(&self, addr: u32, len: usize);

    /// DPRAMの`addr`へ`data`を書き込む転送を開始する。
    fn start_write(&self, addr: u32, data: &[u8]);

    /// コプロセッサのリセット線を操作する。
    fn set_coprocessor_reset(&self, asserted: bool);
}
