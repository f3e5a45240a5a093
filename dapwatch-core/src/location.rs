//! 停止可能なロケーションの共通契約
//!
//! 行ブレークポイント・関数ブレークポイント・ウォッチポイントなど、
//! プロトコルから見える「停止位置」すべてが共有するフィールドと操作です。
//! コレクション管理側はこの契約だけを通して各種ロケーションを扱います。

use crate::engine::WatchEngine;
use crate::error::WatchError;
use crate::hit_condition::HitCondition;
use crate::log_message::LogMessage;
use crate::parse::optional_string;
use serde_json::{Map, Value};

/// ロケーションID（セッション内で一意、再利用しない）
pub type LocationId = u64;

/// クライアントが設定する共通フィールド
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationFields {
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

impl LocationFields {
    /// リクエストのオブジェクトから `condition` / `hitCondition` / `logMessage` を取り出す
    pub fn from_json(obj: &Map<String, Value>) -> Self {
        Self {
            condition: optional_string(obj, "condition"),
            hit_condition: optional_string(obj, "hitCondition"),
            log_message: optional_string(obj, "logMessage"),
        }
    }
}

/// `LocationBase::update` で変化したフィールド
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationChanges {
    pub condition: bool,
    pub hit_condition: bool,
    pub log_message: bool,
}

impl LocationChanges {
    pub fn any(&self) -> bool {
        self.condition || self.hit_condition || self.log_message
    }
}

/// ロケーション共通の状態
#[derive(Debug, Clone)]
pub struct LocationBase {
    pub id: LocationId,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

impl LocationBase {
    pub fn new(id: LocationId) -> Self {
        Self::with_fields(id, LocationFields::default())
    }

    pub fn with_fields(id: LocationId, fields: LocationFields) -> Self {
        Self {
            id,
            condition: fields.condition,
            hit_condition: fields.hit_condition,
            log_message: fields.log_message,
        }
    }

    /// クライアントが最後に送った値で置き換え、変化したフィールドを返す
    ///
    /// 送られなかったフィールドは `None` になり、呼び出し側がネイティブ側の値も解除します。
    pub fn update(&mut self, fields: LocationFields) -> LocationChanges {
        let changes = LocationChanges {
            condition: self.condition != fields.condition,
            hit_condition: self.hit_condition != fields.hit_condition,
            log_message: self.log_message != fields.log_message,
        };
        self.condition = fields.condition;
        self.hit_condition = fields.hit_condition;
        self.log_message = fields.log_message;
        changes
    }

    /// ヒット条件をパースする
    pub fn parsed_hit_condition(&self) -> Result<Option<HitCondition>, WatchError> {
        self.hit_condition
            .as_deref()
            .map(HitCondition::parse)
            .transpose()
    }

    /// ログメッセージをパースする
    pub fn parsed_log_message(&self) -> Result<Option<LogMessage>, WatchError> {
        self.log_message
            .as_deref()
            .map(LogMessage::parse)
            .transpose()
    }

    /// 停止せずにメッセージだけを出すロケーションか
    pub fn is_logpoint(&self) -> bool {
        self.log_message.is_some()
    }

    /// `id` / `verified` / `message` を書き込む
    pub fn serialize_status(&self, object: &mut Map<String, Value>, verified: bool, message: Option<&str>) {
        object.insert("id".to_string(), Value::from(self.id));
        object.insert("verified".to_string(), Value::Bool(verified));
        if let Some(message) = message.filter(|_| !verified) {
            object.insert("message".to_string(), Value::String(message.to_string()));
        }
    }
}

/// すべてのロケーション種別が実装する契約
pub trait Location {
    fn base(&self) -> &LocationBase;

    fn base_mut(&mut self) -> &mut LocationBase;

    fn id(&self) -> LocationId {
        self.base().id
    }

    /// 現在の条件式をネイティブハンドルに反映する
    ///
    /// ハンドルがまだ無い場合は何もせず、インストール成功時に改めて反映されます。
    /// 失敗はロケーションのエラーとして記録し、呼び出し元には返しません。
    fn apply_condition(&mut self, engine: &mut dyn WatchEngine);

    /// 現在のヒット条件をネイティブハンドルに反映する
    ///
    /// パースできない場合はエラーを記録し、ネイティブ側の既存の設定は変更しません。
    fn apply_hit_condition(&mut self, engine: &mut dyn WatchEngine);

    /// クライアントに `verified: true` と報告できるか
    fn is_verified(&self) -> bool;

    /// 未検証の理由
    fn message(&self) -> Option<String>;

    /// プロトコルのオブジェクトに自身を書き込む
    fn serialize(&self, object: &mut Map<String, Value>);

    fn to_json(&self) -> Map<String, Value> {
        let mut object = Map::new();
        self.serialize(&mut object);
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> LocationFields {
        LocationFields::from_json(value.as_object().unwrap())
    }

    #[test]
    fn test_fields_from_json() {
        let f = fields(json!({"condition": "x == 1", "hitCondition": "3", "logMessage": ""}));
        assert_eq!(f.condition.as_deref(), Some("x == 1"));
        assert_eq!(f.hit_condition.as_deref(), Some("3"));
        // 空文字列は未設定
        assert_eq!(f.log_message, None);
    }

    #[test]
    fn test_update_reports_changes_and_clears() {
        let mut base = LocationBase::with_fields(1, fields(json!({"condition": "a", "hitCondition": "2"})));

        let changes = base.update(fields(json!({"condition": "a"})));
        assert_eq!(
            changes,
            LocationChanges { condition: false, hit_condition: true, log_message: false }
        );
        assert_eq!(base.hit_condition, None);

        let changes = base.update(fields(json!({"condition": "a"})));
        assert!(!changes.any());
    }

    #[test]
    fn test_parsed_fields() {
        let mut base = LocationBase::new(3);
        assert_eq!(base.parsed_hit_condition().unwrap(), None);

        base.hit_condition = Some("% 4".to_string());
        assert_eq!(base.parsed_hit_condition().unwrap().unwrap().count, 4);

        base.hit_condition = Some("often".to_string());
        assert!(matches!(base.parsed_hit_condition(), Err(WatchError::Condition(_))));

        base.log_message = Some("v={v}".to_string());
        assert!(base.is_logpoint());
        assert!(base.parsed_log_message().unwrap().is_some());
    }

    #[test]
    fn test_serialize_status() {
        let base = LocationBase::new(7);
        let mut obj = Map::new();
        base.serialize_status(&mut obj, false, Some("no slot"));
        assert_eq!(Value::Object(obj), json!({"id": 7, "verified": false, "message": "no slot"}));

        let mut obj = Map::new();
        base.serialize_status(&mut obj, true, Some("ignored"));
        assert_eq!(Value::Object(obj), json!({"id": 7, "verified": true}));
    }
}
