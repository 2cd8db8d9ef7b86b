/// バイト列用拡張トレイト。
pub trait BytesExt {
    /// 先頭からビッグエンディアンで16ビット符号無し整数を読み込む。
    ///
    /// 事前に長さが2以上あると分かるようなコードであれば最適化が期待できる。
    fn read_be_16(&self) -> u16;
}

impl BytesExt for [u8] {
    #[inline]
    fn read_be_16(&self) -> u16 {
        u16::from_be_bytes(self[..2].try_into().unwrap())
    }
}

/// 要素数`N`のヒープに確保される配列を、`f`を呼び出した戻り値で生成する。
pub fn boxed_array<T, const N: usize, F>(f: F) -> Box<[T; N]>
where
    F: FnMut(usize) -> T,
{
    let slice = (0..N).map(f).collect::<Vec<T>>().into_boxed_slice();

    // Safety: 要素数の分かっている`Box<[T]>`から`Box<[T; N]>`への変換でしかない
    unsafe { Box::from_raw(Box::into_raw(slice) as *mut [T; N]) }
}

/// 内部の数値に書式化を委譲する。
macro_rules! delegate_fmt {
    ($ty:ty) => {
        crate::utils::delegate_fmt!(@each $ty; Display Binary Octal LowerHex UpperHex);
    };
    (@each $ty:ty; $($trait:ident)*) => {
        $(
            impl std::fmt::$trait for $ty {
                #[inline]
                fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                    std::fmt::$trait::fmt(&self.0, f)
                }
            }
        )*
    };
}

/// 条件が常に一致しているものとして事前条件を示す。
///
/// # Safety
///
/// この条件が満たされない場合の動作は未定義である。
macro_rules! assume {
    ($cond:expr) => {{
        if cfg!(debug_assertions) {
            assert!($cond);
        } else if !($cond) {
            std::hint::unreachable_unchecked();
        }
    }};
}

// マクロはpub useできない
pub(crate) use assume;
pub(crate) use delegate_fmt;
