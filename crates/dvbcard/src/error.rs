//! カード操作で発生するエラー。

use std::fmt;

use thiserror::Error;

/// 待機していた段階。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// コマンドレジスタが空くのを待っている。
    CommandIdle,
    /// ハンドシェイクレジスタが空くのを待っている。
    Handshake,
    /// OSDキューが空くのを待っている。
    OsdQueue,
    /// 要求したコマンドの完了を待っている。
    Completion,
    /// ファームウェアのブート状態を待っている。
    Boot,
    /// ビットマップの転送完了を待っている。
    Bitmap,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::CommandIdle => "COMMAND idle",
            Phase::Handshake => "HANDSHAKE",
            Phase::OsdQueue => "OSD queue",
            Phase::Completion => "COMMAND completion",
            Phase::Boot => "boot state",
            Phase::Bitmap => "bitmap upload",
        })
    }
}

/// カード操作で発生するエラー。
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// コプロセッサが時間内に応答しなかった。
    #[error("timeout waiting for {0}")]
    Timeout(Phase),

    /// 既に同じ資源が使用されている。
    #[error("resource busy")]
    Busy,

    /// 非ブロッキング操作を続けるための空きやデータが無い。
    #[error("operation would block")]
    WouldBlock,

    /// 受信したデータの形式が不正。
    #[error("malformed data: {0}")]
    Malformed(&'static str),

    /// ハードウェアフィルターやキューに空きが無い。
    #[error("no free hardware resource")]
    ResourceExhausted,

    /// 待機中にバッファやカードが閉じられた。
    #[error("closed")]
    Closed,

    /// 引数が不正。
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// コプロセッサが起動していない。
    #[error("coprocessor not ready")]
    NotReady,
}

/// カード操作の結果。
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Timeout(Phase::Handshake).to_string(),
            "timeout waiting for HANDSHAKE"
        );
        assert_eq!(
            Error::Malformed("short section").to_string(),
            "malformed data: short section"
        );
    }
}
