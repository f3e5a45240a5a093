//! デバッグセッション
//!
//! 対象プロセス・ハードウェアウォッチエンジン・ウォッチポイント管理をまとめて所有します。
//! エンジンへのアクセスはすべてこのセッションを通して一つのスレッドから行われます。

use crate::engine::HardwareWatchEngine;
use crate::error::ERR_NOT_ATTACHED;
use crate::location::LocationId;
use crate::manager::{HitAction, WatchpointManager};
use crate::protocol::{breakpoints_argument, set_data_breakpoints_body};
use crate::watchpoint::Watchpoint;
use crate::Result;
use dapwatch_target::{Process, PtraceDebugRegisters, StopReason};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

type Engine = HardwareWatchEngine<PtraceDebugRegisters>;

/// 実行継続後の停止理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStop {
    /// ウォッチポイントで停止した
    Watchpoint { id: LocationId, pc: u64 },
    /// ウォッチポイント以外の停止
    Target(StopReason),
}

/// `continue_and_wait` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinueOutcome {
    /// 停止までに出力されたログポイントのメッセージ
    pub logs: Vec<(LocationId, String)>,
    pub stop: SessionStop,
}

/// デバッグセッション
pub struct Session {
    /// デバッグ対象プロセス
    process: Option<Process>,
    /// ウォッチエンジン（プロセスに接続後に作成）
    engine: Option<Engine>,
    /// ウォッチポイント管理
    manager: WatchpointManager,
}

impl Session {
    /// 新しいセッションを作成する
    pub fn new() -> Self {
        Self {
            process: None,
            engine: None,
            manager: WatchpointManager::new(),
        }
    }

    fn require_process(&self) -> Result<&Process> {
        self.process
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))
    }

    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// プロセスは execve 直後に停止しています。デバッグレジスタはクリアしてから使います。
    pub fn spawn<P: AsRef<Path>>(&mut self, program: P, args: &[String]) -> Result<()> {
        self.detach_watches();
        let process = Process::spawn(program, args)?;
        let mut engine = Engine::new(PtraceDebugRegisters::new(process.pid()));
        engine.initialise()?;
        self.engine = Some(engine);
        self.process = Some(process);
        Ok(())
    }

    /// 既存のプロセスにアタッチする
    ///
    /// 既にデバッグレジスタに設定されているウォッチはウォッチポイントとして取り込みます。
    pub fn attach(&mut self, pid: i32) -> Result<Vec<LocationId>> {
        self.detach_watches();
        let process = Process::attach(pid)?;
        let mut engine = Engine::new(PtraceDebugRegisters::new(pid));
        let imported = engine.import_existing()?;
        if !imported.is_empty() {
            info!("found {} existing hardware watch(es) in pid {}", imported.len(), pid);
        }
        let adopted = self.manager.adopt_existing(&mut engine);
        self.engine = Some(engine);
        self.process = Some(process);
        Ok(adopted)
    }

    /// `setDataBreakpoints` を処理し、応答の body を返す
    pub fn set_data_breakpoints(&mut self, arguments: &Value) -> Result<Value> {
        let descriptors = breakpoints_argument(arguments)?;
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        let breakpoints = self.manager.set_data_breakpoints(engine, descriptors)?;
        Ok(set_data_breakpoints_body(breakpoints))
    }

    /// プロセスを実行継続し、停止すべきイベントまで待機する
    ///
    /// 条件を満たさないウォッチポイントのヒットとログポイントでは停止せずに継続します。
    /// `evaluate` は条件式とログメッセージ中の式を評価します。
    pub fn continue_and_wait<F>(&mut self, mut evaluate: F) -> Result<ContinueOutcome>
    where
        F: FnMut(&str) -> std::result::Result<String, String>,
    {
        let mut logs = Vec::new();

        loop {
            let reason = self
                .process
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?
                .continue_and_wait()?;
            if reason != StopReason::Trap {
                return Ok(ContinueOutcome { logs, stop: SessionStop::Target(reason) });
            }

            let engine = self
                .engine
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
            let Some(handle) = engine.triggered()? else {
                return Ok(ContinueOutcome { logs, stop: SessionStop::Target(reason) });
            };
            let Some(hit) = self.manager.resolve_hit(engine, handle, &mut evaluate) else {
                debug!("watch {} fired but no watchpoint owns it", handle);
                continue;
            };

            match hit.action {
                HitAction::Stop => {
                    let pc = self.require_process()?.pc()?;
                    return Ok(ContinueOutcome {
                        logs,
                        stop: SessionStop::Watchpoint { id: hit.id, pc },
                    });
                }
                HitAction::Log(message) => logs.push((hit.id, message)),
                HitAction::Continue => {}
            }
        }
    }

    /// 全てのウォッチポイントを取得する
    pub fn watchpoints(&self) -> impl Iterator<Item = &Watchpoint> {
        self.manager.all()
    }

    /// ウォッチポイント管理を取得する
    pub fn manager(&self) -> &WatchpointManager {
        &self.manager
    }

    /// プロセスID
    pub fn pid(&self) -> Option<i32> {
        self.process.as_ref().map(Process::pid)
    }

    /// 現在のプロセスのウォッチをすべて解放する
    fn detach_watches(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            self.manager.clear(engine);
        }
        self.engine = None;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // デタッチ前にデバッグレジスタを元に戻す
        self.detach_watches();
    }
}
