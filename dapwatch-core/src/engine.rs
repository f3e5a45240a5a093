//! ネイティブウォッチエンジン
//!
//! ウォッチポイントのエンティティとネイティブのウォッチ機構の境界です。
//! `WatchEngine` がエンジン側の能力を表し、`NativeWatch` がエンジンから
//! 取得したハンドルを一度だけ解放されるリソースとして保持します。

use crate::error::WatchError;
use crate::hit_condition::HitCondition;
use crate::Result;
use dapwatch_target::{DebugRegisterIo, DebugRegisters, WatchTrigger};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// アクセス種別（DAP の `accessType`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// すべてのアクセス種別
    pub const ALL: [AccessMode; 3] = [AccessMode::Read, AccessMode::Write, AccessMode::ReadWrite];

    /// ワイヤ上の表記
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::ReadWrite => "readWrite",
        }
    }

    /// x86 のデバッグレジスタは読み取り専用の監視を持たないため、
    /// `read` は読み書き両方の監視に割り当てる
    fn trigger(self) -> WatchTrigger {
        match self {
            AccessMode::Write => WatchTrigger::Write,
            AccessMode::Read | AccessMode::ReadWrite => WatchTrigger::ReadWrite,
        }
    }
}

impl FromStr for AccessMode {
    type Err = WatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "read" => Ok(AccessMode::Read),
            "write" => Ok(AccessMode::Write),
            "readWrite" => Ok(AccessMode::ReadWrite),
            other => Err(WatchError::parse(format!(
                "invalid accessType '{}': expected \"read\", \"write\" or \"readWrite\"",
                other
            ))),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 監視対象（アドレス・サイズ・アクセス種別）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchSpec {
    pub address: u64,
    pub size: usize,
    pub access: AccessMode,
}

/// エンジンが割り当てるウォッチの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u32);

impl WatchHandle {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// ネイティブウォッチエンジンの能力
///
/// 同一セッションのエンジンは単一スレッドから呼び出される前提です（`&mut self`）。
/// エラーはエンジンのメッセージがそのままクライアントに表示されます。
pub trait WatchEngine {
    /// ウォッチを作成する
    fn install_watch(&mut self, address: u64, size: usize, access: AccessMode) -> Result<WatchHandle>;

    /// ウォッチを削除する
    fn remove_watch(&mut self, handle: WatchHandle) -> Result<()>;

    /// 条件式を設定する（`None` で解除）
    fn set_condition(&mut self, handle: WatchHandle, condition: Option<&str>) -> Result<()>;

    /// ヒット条件を設定する（`None` で解除）
    fn set_hit_condition(&mut self, handle: WatchHandle, hit_condition: Option<HitCondition>) -> Result<()>;

    /// ハンドルが指すウォッチの内容。無効なハンドルなら `None`
    fn describe(&self, handle: WatchHandle) -> Option<WatchSpec>;

    /// エンジンが保持しているすべてのハンドル
    fn handles(&self) -> Vec<WatchHandle>;

    /// ヒットを記録し、ヒット条件を満たしたかを返す。無効なハンドルなら `None`
    fn record_hit(&mut self, handle: WatchHandle) -> Option<bool>;
}

/// エンジンのウォッチハンドルを所有するリソース
///
/// `release` で消費されるため二重解放は表現できません。
/// 解放せずに破棄された場合は警告を出します。
#[derive(Debug)]
pub struct NativeWatch {
    handle: WatchHandle,
    spec: WatchSpec,
    armed: bool,
}

impl NativeWatch {
    /// エンジンにウォッチを作成させて取得する
    pub fn acquire(engine: &mut dyn WatchEngine, spec: WatchSpec) -> Result<Self> {
        let handle = engine.install_watch(spec.address, spec.size, spec.access)?;
        debug!("installed watch {} at 0x{:x} (size {}, {})", handle, spec.address, spec.size, spec.access);
        Ok(Self { handle, spec, armed: true })
    }

    /// エンジンに既に存在するハンドルを引き取る
    pub fn adopt(handle: WatchHandle, spec: WatchSpec) -> Self {
        Self { handle, spec, armed: true }
    }

    pub fn handle(&self) -> WatchHandle {
        self.handle
    }

    /// インストール時の監視対象
    pub fn spec(&self) -> WatchSpec {
        self.spec
    }

    /// ハンドルを解放する
    pub fn release(mut self, engine: &mut dyn WatchEngine) {
        self.armed = false;
        match engine.remove_watch(self.handle) {
            Ok(()) => debug!("released watch {}", self.handle),
            Err(e) => warn!("failed to release watch {}: {:#}", self.handle, e),
        }
    }

    /// エンジン側で既に消えたハンドルを手放す
    pub fn forget(mut self) {
        self.armed = false;
    }
}

impl Drop for NativeWatch {
    fn drop(&mut self) {
        if self.armed {
            warn!("watch {} dropped without being released", self.handle);
        }
    }
}

/// ハードウェアウォッチ1件分のエンジン内状態
#[derive(Debug, Clone)]
struct HardwareWatch {
    slot: usize,
    spec: WatchSpec,
    condition: Option<String>,
    hit_condition: Option<HitCondition>,
    hit_count: u64,
}

/// デバッグレジスタによるウォッチエンジン
///
/// 条件式はエンジン内に保持するだけで、評価はセッション側の評価器が行います。
/// ヒット回数とヒット条件の判定はここで行います。
pub struct HardwareWatchEngine<Io> {
    registers: DebugRegisters<Io>,
    watches: BTreeMap<WatchHandle, HardwareWatch>,
    next_handle: u32,
}

impl<Io: DebugRegisterIo> HardwareWatchEngine<Io> {
    /// 新しいエンジンを作成する
    pub fn new(io: Io) -> Self {
        Self {
            registers: DebugRegisters::new(io),
            watches: BTreeMap::new(),
            next_handle: 1,
        }
    }

    fn allocate_handle(&mut self) -> WatchHandle {
        let handle = WatchHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn watch_mut(&mut self, handle: WatchHandle) -> Result<&mut HardwareWatch> {
        self.watches
            .get_mut(&handle)
            .ok_or_else(|| anyhow::anyhow!("no such watch handle {}", handle))
    }

    /// デバッグレジスタをすべてクリアし、保持しているウォッチを破棄する
    pub fn initialise(&mut self) -> Result<()> {
        self.watches.clear();
        self.registers.initialise()
    }

    /// レジスタに既に設定されているウォッチを取り込み、そのハンドルを返す
    pub fn import_existing(&mut self) -> Result<Vec<WatchHandle>> {
        let mut imported = Vec::new();
        for slot in self.registers.load()? {
            let Some(info) = self.registers.slot(slot).copied() else {
                continue;
            };
            let access = match info.trigger {
                WatchTrigger::Write => AccessMode::Write,
                WatchTrigger::ReadWrite => AccessMode::ReadWrite,
            };
            let handle = self.allocate_handle();
            self.watches.insert(
                handle,
                HardwareWatch {
                    slot,
                    spec: WatchSpec { address: info.address, size: info.size, access },
                    condition: None,
                    hit_condition: None,
                    hit_count: 0,
                },
            );
            debug!("imported watch {} from DR{} (0x{:x})", handle, slot, info.address);
            imported.push(handle);
        }
        Ok(imported)
    }

    /// 直前の停止を起こしたウォッチを DR6 から特定する
    pub fn triggered(&mut self) -> Result<Option<WatchHandle>> {
        let Some(slot) = self.registers.triggered()? else {
            return Ok(None);
        };
        Ok(self
            .watches
            .iter()
            .find(|(_, w)| w.slot == slot)
            .map(|(handle, _)| *handle))
    }

    /// ハンドルに設定されている条件式
    pub fn condition(&self, handle: WatchHandle) -> Option<&str> {
        self.watches.get(&handle)?.condition.as_deref()
    }

    /// ハンドルに設定されているヒット条件
    pub fn hit_condition(&self, handle: WatchHandle) -> Option<HitCondition> {
        self.watches.get(&handle)?.hit_condition
    }

    /// ハンドルのヒット回数
    pub fn hit_count(&self, handle: WatchHandle) -> Option<u64> {
        self.watches.get(&handle).map(|w| w.hit_count)
    }

    /// デバッグレジスタを取得する
    pub fn registers(&self) -> &DebugRegisters<Io> {
        &self.registers
    }

    /// デバッグレジスタを可変参照で取得する
    pub fn registers_mut(&mut self) -> &mut DebugRegisters<Io> {
        &mut self.registers
    }
}

impl<Io: DebugRegisterIo> WatchEngine for HardwareWatchEngine<Io> {
    fn install_watch(&mut self, address: u64, size: usize, access: AccessMode) -> Result<WatchHandle> {
        let slot = self.registers.set_watchpoint(address, size, access.trigger())?;
        let handle = self.allocate_handle();
        self.watches.insert(
            handle,
            HardwareWatch {
                slot,
                spec: WatchSpec { address, size, access },
                condition: None,
                hit_condition: None,
                hit_count: 0,
            },
        );
        Ok(handle)
    }

    fn remove_watch(&mut self, handle: WatchHandle) -> Result<()> {
        let watch = self
            .watches
            .remove(&handle)
            .ok_or_else(|| anyhow::anyhow!("no such watch handle {}", handle))?;
        self.registers.unset_watchpoint(watch.slot)
    }

    fn set_condition(&mut self, handle: WatchHandle, condition: Option<&str>) -> Result<()> {
        self.watch_mut(handle)?.condition = condition.map(str::to_string);
        Ok(())
    }

    fn set_hit_condition(&mut self, handle: WatchHandle, hit_condition: Option<HitCondition>) -> Result<()> {
        self.watch_mut(handle)?.hit_condition = hit_condition;
        Ok(())
    }

    fn describe(&self, handle: WatchHandle) -> Option<WatchSpec> {
        self.watches.get(&handle).map(|w| w.spec)
    }

    fn handles(&self) -> Vec<WatchHandle> {
        self.watches.keys().copied().collect()
    }

    fn record_hit(&mut self, handle: WatchHandle) -> Option<bool> {
        let watch = self.watches.get_mut(&handle)?;
        watch.hit_count += 1;
        Some(
            watch
                .hit_condition
                .map_or(true, |hc| hc.is_satisfied(watch.hit_count)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dapwatch_target::InMemoryDebugRegisters;

    fn engine() -> HardwareWatchEngine<InMemoryDebugRegisters> {
        HardwareWatchEngine::new(InMemoryDebugRegisters::new())
    }

    #[test]
    fn test_access_mode_parse() {
        assert_eq!("read".parse::<AccessMode>().unwrap(), AccessMode::Read);
        assert_eq!("readWrite".parse::<AccessMode>().unwrap(), AccessMode::ReadWrite);
        assert!("rw".parse::<AccessMode>().is_err());
        assert_eq!(serde_json::to_value(AccessMode::ReadWrite).unwrap(), "readWrite");
    }

    #[test]
    fn test_install_and_remove() {
        let mut engine = engine();
        let handle = engine.install_watch(0x1000, 4, AccessMode::Read).unwrap();
        assert_eq!(
            engine.describe(handle),
            Some(WatchSpec { address: 0x1000, size: 4, access: AccessMode::Read })
        );
        assert_eq!(engine.registers().in_use(), 1);

        engine.remove_watch(handle).unwrap();
        assert_eq!(engine.describe(handle), None);
        assert_eq!(engine.registers().in_use(), 0);
        assert!(engine.remove_watch(handle).is_err());
    }

    #[test]
    fn test_install_refused() {
        let mut engine = engine();
        let err = engine.install_watch(0x1001, 4, AccessMode::Write).unwrap_err();
        assert!(err.to_string().contains("not aligned"));
        let err = engine.install_watch(0x1000, 16, AccessMode::Write).unwrap_err();
        assert!(err.to_string().contains("unsupported watch size"));
        assert!(engine.handles().is_empty());
    }

    #[test]
    fn test_conditions_need_live_handle() {
        let mut engine = engine();
        let handle = engine.install_watch(0x1000, 8, AccessMode::Write).unwrap();
        engine.set_condition(handle, Some("x > 1")).unwrap();
        assert_eq!(engine.condition(handle), Some("x > 1"));
        engine.set_condition(handle, None).unwrap();
        assert_eq!(engine.condition(handle), None);

        assert!(engine.set_condition(WatchHandle::new(99), Some("x")).is_err());
        assert!(engine.set_hit_condition(WatchHandle::new(99), None).is_err());
    }

    #[test]
    fn test_record_hit_applies_hit_condition() {
        let mut engine = engine();
        let handle = engine.install_watch(0x1000, 8, AccessMode::Write).unwrap();
        assert_eq!(engine.record_hit(handle), Some(true));

        engine
            .set_hit_condition(handle, Some(HitCondition::parse("% 2").unwrap()))
            .unwrap();
        // 設定前のヒットも回数に含まれる
        assert_eq!(engine.record_hit(handle), Some(true));
        assert_eq!(engine.record_hit(handle), Some(false));
        assert_eq!(engine.hit_count(handle), Some(3));
        assert_eq!(engine.record_hit(WatchHandle::new(42)), None);
    }

    #[test]
    fn test_triggered_maps_slot_to_handle() {
        let mut engine = engine();
        let _first = engine.install_watch(0x1000, 4, AccessMode::Write).unwrap();
        let second = engine.install_watch(0x2000, 4, AccessMode::Write).unwrap();

        engine
            .registers_mut()
            .io_mut()
            .set(dapwatch_target::debugreg::DEBUG_STATUS_REG, 0b10);
        assert_eq!(engine.triggered().unwrap(), Some(second));
        assert_eq!(engine.triggered().unwrap(), None);
    }

    #[test]
    fn test_import_existing() {
        let mut io = InMemoryDebugRegisters::new();
        io.set(0, 0x8000);
        io.set(dapwatch_target::debugreg::DEBUG_CONTROL_REG, 1 | 0b01 << 16 | 0b11 << 18);

        let mut engine = HardwareWatchEngine::new(io);
        let handles = engine.import_existing().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(
            engine.describe(handles[0]),
            Some(WatchSpec { address: 0x8000, size: 4, access: AccessMode::Write })
        );
    }
}
