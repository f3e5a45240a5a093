//! dapwatch のコア機能
//!
//! デバッグアダプタのウォッチポイント層です。プロトコルのデータブレークポイントを
//! 共通のロケーション契約で扱い、ハードウェアウォッチに結び付け、
//! 結果をプロトコルのオブジェクトとして返します。

pub mod command;
pub mod engine;
pub mod error;
pub mod hit_condition;
pub mod location;
pub mod log_message;
pub mod manager;
pub mod parse;
pub mod protocol;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod session;
pub mod watchpoint;

pub use command::Command;
pub use engine::{AccessMode, HardwareWatchEngine, NativeWatch, WatchEngine, WatchHandle, WatchSpec};
pub use error::WatchError;
pub use hit_condition::{HitCondition, HitOperator};
pub use location::{Location, LocationBase, LocationChanges, LocationFields, LocationId};
pub use log_message::{LogMessage, LogSegment};
pub use manager::{HitAction, WatchHit, WatchpointManager};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use session::{ContinueOutcome, Session, SessionStop};
pub use watchpoint::{WatchDescriptor, WatchState, Watchpoint};

// 他のクレートから使用するために再エクスポート
pub use dapwatch_target::{InMemoryDebugRegisters, StopReason};

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
