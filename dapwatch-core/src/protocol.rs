//! データブレークポイント関連の DAP リクエスト／レスポンス
//!
//! 転送層から渡された `arguments` を受け取り、`body` を組み立てます。

use crate::engine::AccessMode;
use crate::parse::{format_data_id, parse_address, parse_data_id};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// `dataBreakpointInfo` でサイズが指定されなかったときのバイト数（ポインタ幅）
pub const DEFAULT_WATCH_BYTES: usize = 8;

/// `dataBreakpointInfo` の引数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBreakpointInfoArguments {
    /// アドレス式（`0x1000` または `0x1000/4`）
    pub name: String,
    #[serde(default)]
    pub bytes: Option<usize>,
}

/// `dataBreakpointInfo` の応答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBreakpointInfoResponse {
    /// 監視できない場合は `None`（ワイヤ上は `null`）
    pub data_id: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_types: Vec<AccessMode>,
    #[serde(default)]
    pub can_persist: bool,
}

/// アドレス式から `dataId` を作る
///
/// 変数の解決はこの層では行わず、アドレスとして解釈できる名前だけを受け付けます。
pub fn data_breakpoint_info(arguments: &DataBreakpointInfoArguments) -> DataBreakpointInfoResponse {
    let name = arguments.name.trim();
    let resolved = if name.contains('/') {
        parse_data_id(name)
    } else {
        let size = arguments.bytes.unwrap_or(DEFAULT_WATCH_BYTES);
        parse_address(name).map(|address| (address, size))
    };

    match resolved {
        Ok((address, size)) if size > 0 => DataBreakpointInfoResponse {
            data_id: Some(format_data_id(address, size)),
            description: format!("{} bytes at 0x{:x}", size, address),
            access_types: AccessMode::ALL.to_vec(),
            can_persist: false,
        },
        Ok((_, size)) => DataBreakpointInfoResponse {
            data_id: None,
            description: format!("invalid size {}: watch size must be greater than zero", size),
            access_types: Vec::new(),
            can_persist: false,
        },
        Err(e) => DataBreakpointInfoResponse {
            data_id: None,
            description: e.to_string(),
            access_types: Vec::new(),
            can_persist: false,
        },
    }
}

/// `setDataBreakpoints` の引数から `breakpoints` 配列を取り出す
pub fn breakpoints_argument(arguments: &Value) -> Result<&[Value]> {
    arguments
        .get("breakpoints")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| anyhow::anyhow!("setDataBreakpoints: missing 'breakpoints' array"))
}

/// `setDataBreakpoints` の応答 body
pub fn set_data_breakpoints_body(breakpoints: Vec<Map<String, Value>>) -> Value {
    json!({ "breakpoints": breakpoints })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, bytes: Option<usize>) -> DataBreakpointInfoResponse {
        data_breakpoint_info(&DataBreakpointInfoArguments {
            name: name.to_string(),
            bytes,
        })
    }

    #[test]
    fn test_data_breakpoint_info() {
        let resp = info("0x1000", Some(4));
        assert_eq!(resp.data_id.as_deref(), Some("0x1000/4"));
        assert_eq!(resp.access_types.len(), 3);

        let resp = info("0x2000", None);
        assert_eq!(resp.data_id.as_deref(), Some("0x2000/8"));

        let resp = info("0x3000/2", Some(16));
        assert_eq!(resp.data_id.as_deref(), Some("0x3000/2"));
    }

    #[test]
    fn test_data_breakpoint_info_unavailable() {
        let resp = info("counter", None);
        assert_eq!(resp.data_id, None);
        assert!(resp.description.contains("invalid address"));

        let resp = info("0x1000", Some(0));
        assert_eq!(resp.data_id, None);

        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(wire["dataId"], Value::Null);
        assert!(wire.get("accessTypes").is_none());
    }

    #[test]
    fn test_breakpoints_argument() {
        let args = json!({"breakpoints": [{"dataId": "0x1000/4", "accessType": "write"}]});
        assert_eq!(breakpoints_argument(&args).unwrap().len(), 1);
        assert!(breakpoints_argument(&json!({})).is_err());

        let body = set_data_breakpoints_body(Vec::new());
        assert_eq!(body, json!({"breakpoints": []}));
    }
}
