//! CRC-16 校验
//!
//! 逐位（bit-serial）计算的 CRC-16/MODBUS：反射多项式 0xA001，初值 0xFFFF。
//! 设备端多为单片机实现，逐位算法与其保持一致，不使用查表。

/// 反射多项式
const POLY: u16 = 0xA001;

/// 初始值
const INIT: u16 = 0xFFFF;

/// 计算 CRC-16
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = INIT;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/MODBUS 标准校验值
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_empty() {
        assert_eq!(crc16(&[]), INIT);
    }

    #[test]
    fn test_crc16_single_bit_flip_changes_value() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut flipped = data;
        flipped[2] ^= 0x10;
        assert_ne!(crc16(&data), crc16(&flipped));
    }
}
