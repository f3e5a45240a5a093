//! プロセス制御機能

use crate::Result;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// デバッグ例外（SIGTRAP）。ウォッチポイントかどうかは DR6 で判定する
    Trap,
    /// シグナル受信
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// その他の停止
    Other,
}

impl From<WaitStatus> for StopReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => StopReason::Trap,
            WaitStatus::Stopped(_, signal) => StopReason::Signal(signal),
            WaitStatus::Signaled(_, signal, _) => StopReason::Signal(signal),
            WaitStatus::Exited(_, code) => StopReason::Exited(code),
            _ => StopReason::Other,
        }
    }
}

/// プロセスをどう手に入れたか（後始末の方法が変わる）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Spawned,
    Attached,
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: Pid,
    origin: Origin,
    /// 次の継続時に配送するシグナル
    pending_signal: Option<Signal>,
    exited: bool,
}

fn to_cstring(s: &OsStr) -> Result<CString> {
    Ok(CString::new(s.as_bytes())?)
}

/// 停止するまで待つ。停止以外の状態はエラー
fn wait_for_stop(pid: Pid, after: &str) -> Result<()> {
    match waitpid(pid, None)? {
        WaitStatus::Stopped(_, _) => Ok(()),
        status => Err(anyhow::anyhow!("Unexpected wait status after {}: {:?}", after, status)),
    }
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// 子プロセスは PTRACE_TRACEME の後に execve し、その直後の停止状態で返されます。
    /// 環境変数は親プロセスのものを引き継ぎます。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::unistd::{execve, fork, ForkResult};

        let program = program.as_ref();
        let path = to_cstring(program.as_os_str())?;
        let argv = std::iter::once(Ok(path.clone()))
            .chain(args.iter().map(|arg| to_cstring(OsStr::new(arg))))
            .collect::<Result<Vec<_>>>()?;
        let envp = std::env::vars_os()
            .map(|(key, value)| {
                let mut pair = key;
                pair.push("=");
                pair.push(value);
                to_cstring(&pair)
            })
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                wait_for_stop(child, "execve")?;
                tracing::info!("spawned {} as pid {}", program.display(), child);
                Ok(Self {
                    pid: child,
                    origin: Origin::Spawned,
                    pending_signal: None,
                    exited: false,
                })
            }
            ForkResult::Child => {
                ptrace::traceme()?;
                execve(&path, &argv, &envp)?;
                unreachable!("execve returned without an error");
            }
        }
    }

    /// 既存のプロセスにアタッチする
    ///
    /// PTRACE_ATTACH が送る SIGSTOP を受け取ってから返します。
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)?;
        wait_for_stop(pid, "attach")?;
        tracing::info!("attached to pid {}", pid);

        Ok(Self {
            pid,
            origin: Origin::Attached,
            pending_signal: None,
            exited: false,
        })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// プロセスを実行継続して停止イベントを待機する
    ///
    /// 前回シグナルで停止していた場合、そのシグナルを配送してから継続します。
    pub fn continue_and_wait(&mut self) -> Result<StopReason> {
        if self.exited {
            return Err(anyhow::anyhow!("process {} has already exited", self.pid));
        }

        ptrace::cont(self.pid, self.pending_signal.take())?;
        let status = waitpid(self.pid, None)?;

        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP | Signal::SIGSTOP) => {}
            WaitStatus::Stopped(_, signal) => self.pending_signal = Some(signal),
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => self.exited = true,
            _ => {}
        }

        let reason = StopReason::from(status);
        tracing::debug!("pid {} stopped: {:?}", self.pid, reason);
        Ok(reason)
    }

    /// プログラムカウンタ（RIP）を取得する
    #[cfg(target_arch = "x86_64")]
    pub fn pc(&self) -> Result<u64> {
        let regs = ptrace::getregs(self.pid)?;
        Ok(regs.rip)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        match self.origin {
            // 起動したプロセスは道連れにする
            Origin::Spawned => {
                let _ = ptrace::kill(self.pid);
                let _ = waitpid(self.pid, None);
            }
            Origin::Attached => {
                let _ = ptrace::detach(self.pid, None);
            }
        }
    }
}
