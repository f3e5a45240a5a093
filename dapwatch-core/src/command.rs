//! デバッガコマンド

use crate::location::LocationId;
use crate::parse::parse_address;

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ウォッチポイントを追加（`<addr> <size>` 形式は `dataId` に正規化済み）
    Watch { data_id: String, access: String },
    /// 条件式を設定（`None` で解除）
    Condition { id: LocationId, expr: Option<String> },
    /// ヒット条件を設定（`None` で解除）
    HitCondition { id: LocationId, expr: Option<String> },
    /// ログメッセージを設定（`None` で解除）
    LogMessage { id: LocationId, message: Option<String> },
    /// ウォッチポイントを削除
    Delete(LocationId),
    /// ウォッチポイント一覧表示
    List,
    /// アドレスから dataId を問い合わせる
    Info(String),
    /// 実行継続
    Continue,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

/// `<id> [rest...]` の形を分解する
fn id_and_rest(parts: &[&str]) -> Option<(LocationId, Option<String>)> {
    let id = parts.get(1)?.parse().ok()?;
    let rest = (parts.len() > 2).then(|| parts[2..].join(" "));
    Some((id, rest))
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "watch" | "w" => {
                let target = *parts.get(1)?;
                // `<addr>/<size> [mode]` または `<addr> <size> [mode]`
                let (data_id, mode) = if target.contains('/') {
                    (target.to_string(), parts.get(2))
                } else {
                    // dataId のアドレスは常に16進なので、ここで解釈して正規化する
                    let size = parts.get(2)?;
                    let data_id = match parse_address(target) {
                        Ok(address) => format!("0x{:x}/{}", address, size),
                        Err(_) => format!("{}/{}", target, size),
                    };
                    (data_id, parts.get(3))
                };
                Some(Command::Watch {
                    data_id,
                    access: mode.copied().unwrap_or("write").to_string(),
                })
            }
            "cond" | "condition" => {
                let (id, expr) = id_and_rest(&parts)?;
                Some(Command::Condition { id, expr })
            }
            "hit" => {
                let (id, expr) = id_and_rest(&parts)?;
                Some(Command::HitCondition { id, expr })
            }
            "log" => {
                let (id, message) = id_and_rest(&parts)?;
                Some(Command::LogMessage { id, message })
            }
            "delete" | "d" => parts.get(1)?.parse().ok().map(Command::Delete),
            "list" | "ls" => Some(Command::List),
            "info" => parts.get(1).map(|s| Command::Info(s.to_string())),
            "continue" | "c" => Some(Command::Continue),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
