//! BCD 编解码
//!
//! 长度字段使用压缩 BCD（每字节两位十进制数，高位在前）。

use crate::ProtocolError;
use smallvec::SmallVec;

/// 支持的最大位数（4 字节）
pub const MAX_DIGITS: u8 = 8;

/// 校验 BCD 位数是否合法（2..=8 的偶数）
pub fn check_digits(digits: u8) -> Result<(), ProtocolError> {
    if digits < 2 || digits > MAX_DIGITS || digits % 2 != 0 {
        return Err(ProtocolError::UnsupportedLengthDigits { digits });
    }
    Ok(())
}

/// 编码为 `digits` 位 BCD
///
/// # 错误
/// - `UnsupportedLengthDigits`: 位数不合法
/// - `BcdOverflow`: 数值超出位数可表示的范围
pub fn encode_bcd(value: u64, digits: u8) -> Result<SmallVec<[u8; 4]>, ProtocolError> {
    check_digits(digits)?;
    let limit = 10u64.pow(digits as u32);
    if value >= limit {
        return Err(ProtocolError::BcdOverflow { value, digits });
    }

    let bytes = (digits / 2) as usize;
    let mut out: SmallVec<[u8; 4]> = SmallVec::from_elem(0, bytes);
    let mut rest = value;
    for slot in out.iter_mut().rev() {
        let low = (rest % 10) as u8;
        rest /= 10;
        let high = (rest % 10) as u8;
        rest /= 10;
        *slot = (high << 4) | low;
    }
    Ok(out)
}

/// 解码 BCD 字节序列
pub fn decode_bcd(bytes: &[u8]) -> Result<u64, ProtocolError> {
    let mut value = 0u64;
    for &byte in bytes {
        let high = byte >> 4;
        let low = byte & 0x0F;
        if high > 9 || low > 9 {
            return Err(ProtocolError::InvalidBcd { byte });
        }
        value = value * 100 + (high as u64) * 10 + low as u64;
    }
    Ok(value)
}
