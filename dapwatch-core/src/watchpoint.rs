//! ウォッチポイント
//!
//! (アドレス, サイズ, アクセス種別) をネイティブウォッチに結び付け、
//! クライアントが設定した条件式・ヒット条件と同期させます。

use crate::engine::{AccessMode, NativeWatch, WatchEngine, WatchHandle, WatchSpec};
use crate::error::WatchError;
use crate::location::{Location, LocationBase, LocationFields, LocationId};
use crate::parse::{address_from_json, parse_data_id, size_from_json};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// ウォッチポイントの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// パース直後、まだインストールを試みていない（パース失敗も含む）
    Unbound,
    /// ネイティブハンドルが有効
    Bound,
    /// インストールに失敗した
    Failed,
    /// ハンドルを解放済み（終端状態）
    Released,
}

/// ウォッチポイント
#[derive(Debug)]
pub struct Watchpoint {
    base: LocationBase,
    /// パースに成功した監視対象
    spec: Option<WatchSpec>,
    native: Option<NativeWatch>,
    /// パースまたはインストールの失敗
    last_error: Option<WatchError>,
    condition_error: Option<WatchError>,
    hit_condition_error: Option<WatchError>,
    released: bool,
}

/// ディスクリプタから監視対象を取り出す
///
/// `dataId`（`<address>/<size>`）か、`address` と `size` の組のどちらかを受け付けます。
fn parse_spec(obj: &Map<String, Value>) -> Result<WatchSpec, WatchError> {
    let (address, size) = match obj.get("dataId") {
        Some(Value::String(data_id)) => parse_data_id(data_id)?,
        Some(Value::Null) => {
            return Err(WatchError::parse("dataId is null: no data is available to watch"));
        }
        Some(other) => {
            return Err(WatchError::parse(format!("invalid dataId {}: expected a string", other)));
        }
        None => {
            let address = obj
                .get("address")
                .ok_or_else(|| WatchError::parse("missing address: expected 'dataId' or 'address'"))?;
            let size = obj
                .get("size")
                .ok_or_else(|| WatchError::parse("missing size: expected 'dataId' or 'size'"))?;
            (address_from_json(address)?, size_from_json(size)?)
        }
    };

    let access = match obj.get("accessType") {
        Some(Value::String(s)) => s.parse::<AccessMode>()?,
        Some(other) => {
            return Err(WatchError::parse(format!("invalid accessType {}: expected a string", other)));
        }
        None => return Err(WatchError::parse("missing accessType")),
    };

    Ok(WatchSpec { address, size, access })
}

/// パース済みのウォッチディスクリプタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDescriptor {
    pub fields: LocationFields,
    pub spec: Result<WatchSpec, WatchError>,
}

impl WatchDescriptor {
    /// リクエストの1要素をパースする（I/O を伴わない）
    pub fn parse(descriptor: &Value) -> Self {
        match descriptor.as_object() {
            Some(obj) => Self {
                fields: LocationFields::from_json(obj),
                spec: parse_spec(obj),
            },
            None => Self {
                fields: LocationFields::default(),
                spec: Err(WatchError::parse(format!(
                    "invalid watch descriptor {}: expected an object",
                    descriptor
                ))),
            },
        }
    }
}

impl Watchpoint {
    fn with_parts(base: LocationBase, spec: Option<WatchSpec>, native: Option<NativeWatch>, last_error: Option<WatchError>) -> Self {
        Self {
            base,
            spec,
            native,
            last_error,
            condition_error: None,
            hit_condition_error: None,
            released: false,
        }
    }

    /// プロトコルのディスクリプタから作成する
    ///
    /// フィールドが欠落・不正な場合もエラーを返さず、未検証のエンティティを作ります。
    /// 同じリクエスト内の他のウォッチポイントの処理は継続できます。
    pub fn from_descriptor(id: LocationId, descriptor: &Value) -> Self {
        Self::from_parsed(id, WatchDescriptor::parse(descriptor))
    }

    /// パース済みのディスクリプタから作成する
    pub fn from_parsed(id: LocationId, descriptor: WatchDescriptor) -> Self {
        let base = LocationBase::with_fields(id, descriptor.fields);
        match descriptor.spec {
            Ok(spec) => Self::with_parts(base, Some(spec), None, None),
            Err(e) => {
                debug!("watchpoint {}: {}", id, e);
                Self::with_parts(base, None, None, Some(e))
            }
        }
    }

    /// エンジンに既に存在するウォッチから作成する
    ///
    /// アドレス・サイズ・アクセス種別はエンジンから取得し、条件は未設定のままにします。
    pub fn from_handle(id: LocationId, engine: &dyn WatchEngine, handle: WatchHandle) -> Self {
        match engine.describe(handle) {
            Some(spec) => Self::with_parts(
                LocationBase::new(id),
                Some(spec),
                Some(NativeWatch::adopt(handle, spec)),
                None,
            ),
            None => Self::with_parts(
                LocationBase::new(id),
                None,
                None,
                Some(WatchError::install(format!(
                    "watch handle {} is not known to the engine",
                    handle
                ))),
            ),
        }
    }

    /// ネイティブウォッチを作成または更新する
    ///
    /// 監視対象が変わっておらず、エンジンがハンドルを保持している場合は何もしません。
    /// 新しいハンドルを得たときは保留中の条件式とヒット条件を反映します。
    pub fn set_watchpoint(&mut self, engine: &mut dyn WatchEngine) {
        self.install(engine);
    }

    /// `set_watchpoint` の本体。新しいハンドルをインストールした場合に `true`
    fn install(&mut self, engine: &mut dyn WatchEngine) -> bool {
        if self.released {
            warn!("watchpoint {} is already released", self.base.id);
            return false;
        }
        // パースに失敗したディスクリプタはネイティブ側に渡さない
        let Some(spec) = self.spec else {
            return false;
        };

        if let Some(native) = self.native.take() {
            let live = engine.describe(native.handle());
            if native.spec() == spec && live == Some(spec) {
                self.native = Some(native);
                return false;
            }
            if live.is_some() {
                native.release(engine);
            } else {
                debug!("watch {} vanished from the engine", native.handle());
                native.forget();
            }
        }

        match NativeWatch::acquire(engine, spec) {
            Ok(native) => {
                self.native = Some(native);
                self.last_error = None;
                self.condition_error = None;
                self.hit_condition_error = None;

                // 新しいハンドルには条件が付いていない
                if self.base.condition.is_some() {
                    self.apply_condition(engine);
                }
                if self.base.hit_condition.is_some() {
                    self.apply_hit_condition(engine);
                }
                true
            }
            Err(e) => {
                info!("watchpoint {} at 0x{:x} not installed: {:#}", self.base.id, spec.address, e);
                self.last_error = Some(WatchError::install(format!("{:#}", e)));
                self.condition_error = None;
                self.hit_condition_error = None;
                false
            }
        }
    }

    /// クライアントが同じ (アドレス, サイズ) を再送したときの更新
    ///
    /// アクセス種別が変われば再インストールし、条件だけが変わった場合は
    /// 変わったものだけを反映します。
    pub fn update(&mut self, spec: WatchSpec, fields: LocationFields, engine: &mut dyn WatchEngine) {
        let changes = self.base.update(fields);
        self.spec = Some(spec);

        if self.install(engine) {
            return;
        }
        if changes.condition {
            self.apply_condition(engine);
        }
        if changes.hit_condition {
            self.apply_hit_condition(engine);
        }
    }

    /// ネイティブハンドルを解放する（以後このエンティティは使わない）
    pub fn release(&mut self, engine: &mut dyn WatchEngine) {
        if let Some(native) = self.native.take() {
            native.release(engine);
        }
        self.last_error = None;
        self.released = true;
    }

    /// 現在の状態
    pub fn state(&self) -> WatchState {
        if self.released {
            WatchState::Released
        } else if self.native.is_some() {
            WatchState::Bound
        } else if self.spec.is_some() && self.last_error.is_some() {
            WatchState::Failed
        } else {
            WatchState::Unbound
        }
    }

    /// `set_watchpoint` 後の不変条件（ハンドルが有効 ⇔ エラーなし）を検査する
    pub fn check_invariant(&self) -> Result<(), WatchError> {
        if self.released {
            return Ok(());
        }
        match (&self.native, &self.last_error) {
            (Some(native), Some(err)) => Err(WatchError::Internal(format!(
                "watchpoint {} holds watch {} but also reports '{}'",
                self.base.id,
                native.handle(),
                err
            ))),
            (None, None) => Err(WatchError::Internal(format!(
                "watchpoint {} has neither a watch handle nor an error",
                self.base.id
            ))),
            _ => Ok(()),
        }
    }

    /// 監視対象（パースに失敗した場合は `None`）
    pub fn spec(&self) -> Option<WatchSpec> {
        self.spec
    }

    pub fn address(&self) -> Option<u64> {
        self.spec.map(|s| s.address)
    }

    pub fn size(&self) -> Option<usize> {
        self.spec.map(|s| s.size)
    }

    pub fn access(&self) -> Option<AccessMode> {
        self.spec.map(|s| s.access)
    }

    /// 有効なネイティブハンドル
    pub fn handle(&self) -> Option<WatchHandle> {
        self.native.as_ref().map(NativeWatch::handle)
    }

    /// 直近のパース／インストールエラー
    pub fn last_error(&self) -> Option<&WatchError> {
        self.last_error.as_ref()
    }

    /// 直近の条件式／ヒット条件のエラー
    pub fn condition_error(&self) -> Option<&WatchError> {
        self.condition_error
            .as_ref()
            .or(self.hit_condition_error.as_ref())
    }
}

impl Location for Watchpoint {
    fn base(&self) -> &LocationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LocationBase {
        &mut self.base
    }

    fn apply_condition(&mut self, engine: &mut dyn WatchEngine) {
        let Some(handle) = self.handle() else {
            return;
        };

        match engine.set_condition(handle, self.base.condition.as_deref()) {
            Ok(()) => self.condition_error = None,
            Err(e) => {
                warn!("watchpoint {}: failed to set condition: {:#}", self.base.id, e);
                self.condition_error = Some(WatchError::condition(format!("{:#}", e)));
            }
        }
    }

    fn apply_hit_condition(&mut self, engine: &mut dyn WatchEngine) {
        let Some(handle) = self.handle() else {
            return;
        };

        let hit_condition = match self.base.parsed_hit_condition() {
            Ok(hc) => hc,
            Err(e) => {
                // ネイティブ側の既存の設定はそのまま
                warn!("watchpoint {}: {}", self.base.id, e);
                self.hit_condition_error = Some(e);
                return;
            }
        };

        match engine.set_hit_condition(handle, hit_condition) {
            Ok(()) => self.hit_condition_error = None,
            Err(e) => {
                warn!("watchpoint {}: failed to set hit condition: {:#}", self.base.id, e);
                self.hit_condition_error = Some(WatchError::condition(format!("{:#}", e)));
            }
        }
    }

    fn is_verified(&self) -> bool {
        self.native.is_some() && self.message().is_none()
    }

    fn message(&self) -> Option<String> {
        if let Some(err) = self.last_error.as_ref().or(self.condition_error()) {
            return Some(err.to_string());
        }
        if self.native.is_none() {
            return None;
        }
        self.base.parsed_log_message().err().map(|e| e.to_string())
    }

    fn serialize(&self, object: &mut Map<String, Value>) {
        self.base
            .serialize_status(object, self.is_verified(), self.message().as_deref());
        if let Some(spec) = self.spec {
            object.insert("address".to_string(), Value::String(format!("0x{:x}", spec.address)));
            object.insert("size".to_string(), Value::from(spec.size));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HardwareWatchEngine;
    use dapwatch_target::InMemoryDebugRegisters;
    use serde_json::json;

    fn engine() -> HardwareWatchEngine<InMemoryDebugRegisters> {
        HardwareWatchEngine::new(InMemoryDebugRegisters::new())
    }

    #[test]
    fn test_install_and_serialize() {
        let mut engine = engine();
        let mut wp = Watchpoint::from_descriptor(
            1,
            &json!({"address": 0x1000, "size": 4, "accessType": "write"}),
        );
        assert_eq!(wp.state(), WatchState::Unbound);

        wp.set_watchpoint(&mut engine);
        assert_eq!(wp.state(), WatchState::Bound);
        assert!(wp.last_error().is_none());
        wp.check_invariant().unwrap();

        assert_eq!(
            Value::Object(wp.to_json()),
            json!({"id": 1, "verified": true, "address": "0x1000", "size": 4})
        );
        wp.release(&mut engine);
    }

    #[test]
    fn test_data_id_descriptor() {
        let wp = Watchpoint::from_descriptor(2, &json!({"dataId": "0x2008/8", "accessType": "readWrite"}));
        assert_eq!(
            wp.spec(),
            Some(WatchSpec { address: 0x2008, size: 8, access: AccessMode::ReadWrite })
        );
    }

    #[test]
    fn test_invalid_size_is_reported_without_install() {
        let mut engine = engine();
        let mut wp = Watchpoint::from_descriptor(
            3,
            &json!({"address": "0x2000", "size": 0, "accessType": "read"}),
        );
        assert!(!wp.is_verified());
        assert!(wp.message().unwrap().contains("invalid size"));

        wp.set_watchpoint(&mut engine);
        assert!(engine.handles().is_empty());
        assert_eq!(
            Value::Object(wp.to_json()),
            json!({"id": 3, "verified": false, "message": "invalid size 0: watch size must be greater than zero"})
        );
    }

    #[test]
    fn test_missing_fields() {
        for descriptor in [
            json!({"size": 4, "accessType": "write"}),
            json!({"address": 4096, "accessType": "write"}),
            json!({"address": 4096, "size": 4}),
            json!({"address": 4096, "size": 4, "accessType": "execute"}),
            json!({"dataId": null, "accessType": "write"}),
            json!("0x1000/4"),
        ] {
            let wp = Watchpoint::from_descriptor(9, &descriptor);
            assert!(!wp.is_verified(), "{}", descriptor);
            assert!(!wp.message().unwrap_or_default().is_empty(), "{}", descriptor);
            wp.check_invariant().unwrap();
        }
    }

    #[test]
    fn test_install_failure_keeps_engine_text() {
        let mut engine = engine();
        let mut wp = Watchpoint::from_descriptor(4, &json!({"dataId": "0x1001/4", "accessType": "write"}));
        wp.set_watchpoint(&mut engine);

        assert_eq!(wp.state(), WatchState::Failed);
        assert!(wp.handle().is_none());
        assert!(matches!(wp.last_error(), Some(WatchError::Install(msg)) if msg.contains("not aligned")));
        wp.check_invariant().unwrap();

        let json = Value::Object(wp.to_json());
        assert_eq!(json["verified"], false);
        assert_eq!(json["address"], "0x1001");
    }

    #[test]
    fn test_resend_unchanged_is_noop() {
        let mut engine = engine();
        let mut wp = Watchpoint::from_descriptor(5, &json!({"dataId": "0x1000/4", "accessType": "write"}));
        wp.set_watchpoint(&mut engine);
        let handle = wp.handle().unwrap();

        wp.set_watchpoint(&mut engine);
        assert_eq!(wp.handle(), Some(handle));
        assert_eq!(wp.address(), Some(0x1000));
        assert_eq!(wp.size(), Some(4));
        assert_eq!(engine.handles(), vec![handle]);
        wp.release(&mut engine);
    }

    #[test]
    fn test_condition_deferred_until_install() {
        let mut engine = engine();
        let mut wp = Watchpoint::from_descriptor(
            6,
            &json!({"dataId": "0x1000/4", "accessType": "write", "condition": "x > 2", "hitCondition": "% 2"}),
        );
        // ハンドルが無いうちは何もしない
        wp.apply_condition(&mut engine);
        assert!(wp.condition_error().is_none());

        wp.set_watchpoint(&mut engine);
        let handle = wp.handle().unwrap();
        assert_eq!(engine.condition(handle), Some("x > 2"));
        assert_eq!(engine.hit_condition(handle).unwrap().to_string(), "% 2");
        wp.release(&mut engine);
    }

    #[test]
    fn test_condition_survives_reinstall() {
        let mut engine = engine();
        let mut wp = Watchpoint::from_descriptor(7, &json!({"dataId": "0x1000/4", "accessType": "write"}));
        wp.set_watchpoint(&mut engine);
        let first = wp.handle().unwrap();

        wp.base_mut().condition = Some("flag".to_string());
        wp.apply_condition(&mut engine);
        assert_eq!(engine.condition(first), Some("flag"));

        let fields = LocationFields {
            condition: Some("flag".to_string()),
            ..Default::default()
        };
        let spec = WatchSpec { address: 0x3000, size: 8, access: AccessMode::Write };
        wp.update(spec, fields, &mut engine);

        let second = wp.handle().unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.describe(first), None);
        assert_eq!(engine.condition(second), Some("flag"));
        wp.release(&mut engine);
    }

    #[test]
    fn test_unset_condition_clears_native_side() {
        let mut engine = engine();
        let mut wp = Watchpoint::from_descriptor(
            8,
            &json!({"dataId": "0x1000/4", "accessType": "write", "condition": "a"}),
        );
        wp.set_watchpoint(&mut engine);
        let handle = wp.handle().unwrap();

        let spec = wp.spec().unwrap();
        wp.update(spec, LocationFields::default(), &mut engine);
        assert_eq!(wp.handle(), Some(handle));
        assert_eq!(engine.condition(handle), None);
        wp.release(&mut engine);
    }

    #[test]
    fn test_bad_hit_condition_keeps_previous() {
        let mut engine = engine();
        let mut wp = Watchpoint::from_descriptor(
            10,
            &json!({"dataId": "0x1000/4", "accessType": "write", "hitCondition": "3"}),
        );
        wp.set_watchpoint(&mut engine);
        let handle = wp.handle().unwrap();

        let spec = wp.spec().unwrap();
        let fields = LocationFields {
            hit_condition: Some("sometimes".to_string()),
            ..Default::default()
        };
        wp.update(spec, fields, &mut engine);

        assert!(matches!(wp.condition_error(), Some(WatchError::Condition(_))));
        assert!(!wp.is_verified());
        assert_eq!(engine.hit_condition(handle).unwrap().to_string(), ">= 3");
        // ハンドル自体は有効なまま
        wp.check_invariant().unwrap();
        wp.release(&mut engine);
    }

    #[test]
    fn test_from_handle() {
        let mut engine = engine();
        let handle = engine.install_watch(0x4000, 2, AccessMode::Read).unwrap();

        let mut wp = Watchpoint::from_handle(11, &engine, handle);
        assert_eq!(wp.state(), WatchState::Bound);
        assert_eq!(wp.access(), Some(AccessMode::Read));
        assert_eq!(wp.base().condition, None);

        wp.release(&mut engine);
        assert_eq!(wp.state(), WatchState::Released);
        assert!(engine.handles().is_empty());

        let stale = Watchpoint::from_handle(12, &engine, handle);
        assert!(!stale.is_verified());
    }
}
