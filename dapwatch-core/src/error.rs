//! ウォッチポイントのエラー分類

use thiserror::Error;

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// ウォッチポイントが見つからない場合のエラーメッセージ
pub const ERR_WATCHPOINT_NOT_FOUND: &str = "Watchpoint not found";

/// ロケーション単位で記録されるエラー
///
/// `Parse`/`Install`/`Condition` はエンティティに記録され、クライアントには
/// `verified: false` と `message` で通知されます。同じリクエスト内の他の
/// ウォッチポイントの処理を止めることはありません。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// ディスクリプタのフィールドが欠落または不正
    #[error("{0}")]
    Parse(String),
    /// ネイティブエンジンがウォッチの作成を拒否した
    #[error("{0}")]
    Install(String),
    /// 条件式またはヒット条件をハンドルに設定できなかった
    #[error("{0}")]
    Condition(String),
    /// 内部不変条件の違反（バグ）
    #[error("internal error: {0}")]
    Internal(String),
}

impl WatchError {
    pub fn parse(msg: impl Into<String>) -> Self {
        WatchError::Parse(msg.into())
    }

    pub fn install(msg: impl Into<String>) -> Self {
        WatchError::Install(msg.into())
    }

    pub fn condition(msg: impl Into<String>) -> Self {
        WatchError::Condition(msg.into())
    }
}
