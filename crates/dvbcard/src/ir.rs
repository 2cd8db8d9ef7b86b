//! リモコン受信コードの配送先。

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// リモコン受信コードを受け取るデバイスの識別子。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// リモコン受信コードを受け取る関数。
pub type IrHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// 転送された4バイトからリモコン受信コードを取り出す。
///
/// コプロセッサは上位と下位の16ビットを入れ替えて格納している。
#[inline]
pub fn decode_ir_code(data: [u8; 4]) -> u32 {
    u32::from_le_bytes(data).rotate_left(16)
}

/// デバイスごとの受信コードの配送先。
#[derive(Default)]
pub struct IrRegistry {
    handlers: RwLock<FxHashMap<DeviceId, IrHandler>>,
}

impl IrRegistry {
    /// 空の`IrRegistry`を生成する。
    pub fn new() -> IrRegistry {
        IrRegistry::default()
    }

    /// `device`の受信コードを`handler`へ渡すようにする。
    ///
    /// 既に登録されている場合は`Error::Busy`を返す。
    pub fn register<F>(&self, device: DeviceId, handler: F) -> Result<()>
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&device) {
            return Err(Error::Busy);
        }
        handlers.insert(device, Arc::new(handler));
        Ok(())
    }

    /// `device`の登録を解除する。登録されていれば`true`を返す。
    pub fn unregister(&self, device: DeviceId) -> bool {
        self.handlers.write().remove(&device).is_some()
    }

    /// `device`の受信コードを配送する。配送先が無ければ`false`を返す。
    pub fn dispatch(&self, device: DeviceId, code: u32) -> bool {
        // 呼び出し中に登録を変更できるよう、ロックを外してから呼ぶ
        let handler = self.handlers.read().get(&device).cloned();
        match handler {
            Some(handler) => {
                log::trace!("ir {:?}: {:08X}", device, code);
                handler(code);
                true
            }
            None => {
                log::debug!("ir {:?}: no handler for {:08X}", device, code);
                false
            }
        }
    }
}

impl fmt::Debug for IrRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IrRegistry")
            .field("devices", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
