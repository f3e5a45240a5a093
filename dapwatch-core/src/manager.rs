//! ウォッチポイント管理
//!
//! `setDataBreakpoints` リクエストは常にウォッチポイントの全リストを送ってくるため、
//! 前回のリストとの差分を取り、同じ (アドレス, サイズ) のものはその場で更新、
//! 新しいものは作成、含まれなくなったものは解放します。

use crate::engine::{WatchEngine, WatchHandle};
use crate::error::WatchError;
use crate::location::{Location, LocationId};
use crate::parse::format_data_id;
use crate::watchpoint::{WatchDescriptor, Watchpoint};
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, info};

/// ウォッチポイントを同一視するキー（アドレス, サイズ）
type WatchKey = (u64, usize);

/// ヒット時の動作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitAction {
    /// 停止する
    Stop,
    /// 条件またはヒット条件を満たさないので実行を続ける
    Continue,
    /// ログポイント：メッセージを出して実行を続ける
    Log(String),
}

/// ウォッチポイントのヒット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHit {
    pub id: LocationId,
    pub action: HitAction,
}

/// 条件式の評価結果を真偽値として解釈する
fn is_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "0x0")
}

/// ウォッチポイントマネージャ
pub struct WatchpointManager {
    watchpoints: BTreeMap<LocationId, Watchpoint>,
    next_id: LocationId,
}

impl WatchpointManager {
    /// 新しいウォッチポイントマネージャを作成する
    pub fn new() -> Self {
        Self {
            watchpoints: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> LocationId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// `setDataBreakpoints` のウォッチポイントリストを適用する
    ///
    /// 応答はリクエストと同じ順序で返します。個々のウォッチポイントの失敗は
    /// 応答の `verified: false` として報告し、残りの処理は続けます。
    /// `Err` は内部不変条件が破れた場合のみです。
    pub fn set_data_breakpoints(
        &mut self,
        engine: &mut dyn WatchEngine,
        descriptors: &[Value],
    ) -> Result<Vec<Map<String, Value>>, WatchError> {
        let parsed: Vec<WatchDescriptor> = descriptors.iter().map(WatchDescriptor::parse).collect();
        let requested: HashSet<WatchKey> = parsed
            .iter()
            .filter_map(|d| d.spec.as_ref().ok())
            .map(|spec| (spec.address, spec.size))
            .collect();

        // 先に解放してデバッグレジスタのスロットを空ける
        let mut previous: BTreeMap<WatchKey, Watchpoint> = BTreeMap::new();
        for (_, mut wp) in std::mem::take(&mut self.watchpoints) {
            match wp.spec().map(|s| (s.address, s.size)) {
                Some(key) if requested.contains(&key) => match previous.entry(key) {
                    Entry::Vacant(slot) => {
                        slot.insert(wp);
                    }
                    // 同じキーのウォッチポイントは一つしか引き継げない
                    Entry::Occupied(_) => {
                        info!("releasing watchpoint {} (shares {} with another)", wp.id(), format_data_id(key.0, key.1));
                        wp.release(engine);
                    }
                },
                _ => {
                    info!("releasing watchpoint {} (no longer requested)", wp.id());
                    wp.release(engine);
                }
            }
        }

        let mut responses = Vec::with_capacity(parsed.len());
        let mut seen: HashSet<WatchKey> = HashSet::new();
        let mut internal = None;

        for descriptor in parsed {
            let spec = match descriptor.spec {
                Ok(spec) => spec,
                Err(_) => {
                    // 追跡はせず応答にだけ含める
                    let wp = Watchpoint::from_parsed(self.allocate_id(), descriptor);
                    responses.push(wp.to_json());
                    continue;
                }
            };

            let key = (spec.address, spec.size);
            if !seen.insert(key) {
                let mut duplicate = descriptor;
                duplicate.spec = Err(WatchError::parse(format!(
                    "duplicate watchpoint for {} in the same request",
                    format_data_id(spec.address, spec.size)
                )));
                let wp = Watchpoint::from_parsed(self.allocate_id(), duplicate);
                responses.push(wp.to_json());
                continue;
            }

            let wp = match previous.remove(&key) {
                Some(mut wp) => {
                    debug!("updating watchpoint {} at {}", wp.id(), format_data_id(spec.address, spec.size));
                    wp.update(spec, descriptor.fields, engine);
                    wp
                }
                None => {
                    let mut wp = Watchpoint::from_parsed(self.allocate_id(), descriptor);
                    wp.set_watchpoint(engine);
                    wp
                }
            };

            if let Err(e) = wp.check_invariant() {
                error!("{}", e);
                internal.get_or_insert(e);
            }

            responses.push(wp.to_json());
            self.watchpoints.insert(wp.id(), wp);
        }

        match internal {
            Some(e) => Err(e),
            None => Ok(responses),
        }
    }

    /// エンジンにあって、どのウォッチポイントも所有していないハンドルを取り込む
    pub fn adopt_existing(&mut self, engine: &mut dyn WatchEngine) -> Vec<LocationId> {
        let owned: HashSet<WatchHandle> = self.watchpoints.values().filter_map(Watchpoint::handle).collect();
        let mut adopted = Vec::new();

        for handle in engine.handles() {
            if owned.contains(&handle) {
                continue;
            }
            let id = self.allocate_id();
            let wp = Watchpoint::from_handle(id, engine, handle);
            debug!("adopted watch {} as watchpoint {}", handle, id);
            self.watchpoints.insert(id, wp);
            adopted.push(id);
        }

        adopted
    }

    /// 発火したハンドルをウォッチポイントに対応付け、停止するかどうかを決める
    ///
    /// 条件式が偽ならヒットとして数えません。評価に失敗した場合は停止します。
    pub fn resolve_hit<F>(&self, engine: &mut dyn WatchEngine, handle: WatchHandle, mut evaluate: F) -> Option<WatchHit>
    where
        F: FnMut(&str) -> Result<String, String>,
    {
        let wp = self.watchpoints.values().find(|wp| wp.handle() == Some(handle))?;
        let id = wp.id();
        let base = wp.base();

        if let Some(condition) = base.condition.as_deref() {
            match evaluate(condition) {
                Ok(value) if !is_truthy(&value) => {
                    return Some(WatchHit { id, action: HitAction::Continue });
                }
                Ok(_) => {}
                Err(e) => debug!("watchpoint {}: condition '{}' failed: {}", id, condition, e),
            }
        }

        if !engine.record_hit(handle)? {
            return Some(WatchHit { id, action: HitAction::Continue });
        }

        let action = match base.parsed_log_message() {
            Ok(Some(message)) => HitAction::Log(message.format(&mut evaluate)),
            Ok(None) => HitAction::Stop,
            // 壊れたテンプレートはそのまま出力する
            Err(_) => HitAction::Log(base.log_message.clone().unwrap_or_default()),
        };
        Some(WatchHit { id, action })
    }

    /// ウォッチポイントを取得する
    pub fn get(&self, id: LocationId) -> Option<&Watchpoint> {
        self.watchpoints.get(&id)
    }

    /// 全てのウォッチポイントを取得する（ID順）
    pub fn all(&self) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.values()
    }

    /// ウォッチポイントの数を取得する
    pub fn count(&self) -> usize {
        self.watchpoints.len()
    }

    /// すべてのウォッチポイントを解放する
    pub fn clear(&mut self, engine: &mut dyn WatchEngine) {
        for (_, mut wp) in std::mem::take(&mut self.watchpoints) {
            wp.release(engine);
        }
    }
}

impl Default for WatchpointManager {
    fn default() -> Self {
        Self::new()
    }
}
