//! パース関連のユーティリティ関数

use crate::error::WatchError;
use serde_json::Value;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use dapwatch_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64, WatchError> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| WatchError::parse(format!("invalid hexadecimal address '{}': {}", s, e)))
    } else {
        // 10進数でもダメなら16進数として解釈を試みる
        s.parse::<u64>()
            .or_else(|_| u64::from_str_radix(s, 16))
            .map_err(|e| WatchError::parse(format!("invalid address '{}': {}", s, e)))
    }
}

/// ウォッチサイズをパースする（正の整数のみ）
pub fn parse_size(s: &str) -> Result<usize, WatchError> {
    let size = s
        .trim()
        .parse::<usize>()
        .map_err(|e| WatchError::parse(format!("invalid size '{}': {}", s.trim(), e)))?;
    check_size(size)
}

fn check_size(size: usize) -> Result<usize, WatchError> {
    if size == 0 {
        return Err(WatchError::parse("invalid size 0: watch size must be greater than zero"));
    }
    Ok(size)
}

/// `dataId` を組み立てる（`dataBreakpointInfo` の応答で使う形式）
pub fn format_data_id(address: u64, size: usize) -> String {
    format!("0x{:x}/{}", address, size)
}

/// `dataId`（`<address>/<size>`）をパースする
///
/// アドレス部は `0x` の有無にかかわらず16進数として扱います。
pub fn parse_data_id(data_id: &str) -> Result<(u64, usize), WatchError> {
    let (addr_str, size_str) = data_id
        .split_once('/')
        .ok_or_else(|| WatchError::parse(format!("invalid dataId '{}': expected '<address>/<size>'", data_id)))?;

    let addr_str = addr_str.trim();
    let hex = addr_str
        .strip_prefix("0x")
        .or_else(|| addr_str.strip_prefix("0X"))
        .unwrap_or(addr_str);
    let address = u64::from_str_radix(hex, 16)
        .map_err(|e| WatchError::parse(format!("invalid address '{}' in dataId: {}", addr_str, e)))?;
    let size = parse_size(size_str)?;

    Ok((address, size))
}

/// JSON の値（数値または文字列）からアドレスを取り出す
pub fn address_from_json(value: &Value) -> Result<u64, WatchError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| WatchError::parse(format!("invalid address {}: expected an unsigned integer", n))),
        Value::String(s) => parse_address(s),
        other => Err(WatchError::parse(format!("invalid address {}: expected a number or string", other))),
    }
}

/// JSON の値（数値または文字列）からサイズを取り出す
pub fn size_from_json(value: &Value) -> Result<usize, WatchError> {
    match value {
        Value::Number(n) => {
            let size = n
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| WatchError::parse(format!("invalid size {}: expected a positive integer", n)))?;
            check_size(size)
        }
        Value::String(s) => parse_size(s),
        other => Err(WatchError::parse(format!("invalid size {}: expected a positive integer", other))),
    }
}

/// 任意の文字列フィールドを取り出す（空文字列は未設定扱い）
pub fn optional_string(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0X1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0xABCD").unwrap(), 0xabcd);
    }

    #[test]
    fn test_parse_address_dec() {
        assert_eq!(parse_address("1234").unwrap(), 1234);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
    }

    #[test]
    fn test_parse_data_id() {
        assert_eq!(parse_data_id("0x1000/4").unwrap(), (0x1000, 4));
        // アドレス部は常に16進数
        assert_eq!(parse_data_id("1000/8").unwrap(), (0x1000, 8));
        assert_eq!(parse_data_id(&format_data_id(0x7ffd_0010, 2)).unwrap(), (0x7ffd_0010, 2));
    }

    #[test]
    fn test_parse_data_id_invalid() {
        assert!(parse_data_id("0x1000").is_err());
        assert!(parse_data_id("zz/4").is_err());
        let err = parse_data_id("0x1000/0").unwrap_err();
        assert!(err.to_string().contains("invalid size"));
    }

    #[test]
    fn test_json_fields() {
        assert_eq!(address_from_json(&json!(4096)).unwrap(), 4096);
        assert_eq!(address_from_json(&json!("0x1000")).unwrap(), 0x1000);
        assert!(address_from_json(&json!(-1)).is_err());
        assert!(address_from_json(&json!(true)).is_err());

        assert_eq!(size_from_json(&json!(4)).unwrap(), 4);
        assert_eq!(size_from_json(&json!("8")).unwrap(), 8);
        assert!(size_from_json(&json!(0)).is_err());
        assert!(size_from_json(&json!(1.5)).is_err());
    }
}
