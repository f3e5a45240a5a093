//! dapwatch ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスとハードウェアウォッチの低レベル機能を提供します。
//! ptrace によるプロセス制御と、x86-64 デバッグレジスタの読み書きを行います。

pub mod debugreg;
pub mod process;

pub use debugreg::{
    validate_region, DebugRegisterError, DebugRegisterIo, DebugRegisters, InMemoryDebugRegisters,
    WatchSlot, WatchTrigger, MAX_WATCH_SLOTS,
};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use debugreg::PtraceDebugRegisters;
pub use process::{Process, StopReason};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
