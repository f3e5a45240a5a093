//! ハードウェアウォッチポイント（x86-64 デバッグレジスタ）
//!
//! DR0-DR3 に監視アドレスを、DR7 に有効ビット・アクセス種別・長さを書き込みます。
//! ヒットしたスロットは DR6 の下位4ビットで判定します。

use crate::Result;
use thiserror::Error;

/// 使用可能なウォッチスロット数（DR0-DR3）
pub const MAX_WATCH_SLOTS: usize = 4;

/// デバッグステータスレジスタ（DR6）
pub const DEBUG_STATUS_REG: usize = 6;

/// デバッグコントロールレジスタ（DR7）
pub const DEBUG_CONTROL_REG: usize = 7;

/// ウォッチの発火条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTrigger {
    /// 書き込み時のみ
    Write,
    /// 読み取りまたは書き込み時
    ReadWrite,
}

impl WatchTrigger {
    /// DR7 の R/W フィールド値
    fn rw_bits(self) -> u64 {
        match self {
            WatchTrigger::Write => 0b01,
            WatchTrigger::ReadWrite => 0b11,
        }
    }
}

/// デバッグレジスタ操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebugRegisterError {
    #[error("no free hardware watch slot for 0x{0:x} (all debug registers in use)")]
    NoFreeSlots(u64),
    #[error("unsupported watch size {0} (expected 1, 2, 4 or 8)")]
    InvalidSize(usize),
    #[error("address 0x{address:x} is not aligned to the watch size {size}")]
    Misaligned { address: u64, size: usize },
    #[error("watch slot {0} is not in use")]
    EmptySlot(usize),
}

/// 使用中のウォッチスロット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSlot {
    pub address: u64,
    pub size: usize,
    pub trigger: WatchTrigger,
}

const fn dr7_enable_shift(slot: usize) -> u32 {
    (slot * 2) as u32
}

const fn dr7_rw_shift(slot: usize) -> u32 {
    (16 + slot * 4) as u32
}

const fn dr7_len_shift(slot: usize) -> u32 {
    (18 + slot * 4) as u32
}

/// DR7 の LEN フィールド値（8バイトは 0b10）
fn len_bits(size: usize) -> std::result::Result<u64, DebugRegisterError> {
    match size {
        1 => Ok(0b00),
        2 => Ok(0b01),
        4 => Ok(0b11),
        8 => Ok(0b10),
        _ => Err(DebugRegisterError::InvalidSize(size)),
    }
}

/// 監視領域がハードウェアの制約を満たすか検証する
pub fn validate_region(address: u64, size: usize) -> std::result::Result<(), DebugRegisterError> {
    len_bits(size)?;
    if address % size as u64 != 0 {
        return Err(DebugRegisterError::Misaligned { address, size });
    }
    Ok(())
}

/// デバッグレジスタの読み書き手段
pub trait DebugRegisterIo {
    /// DRn を読み取る
    fn read(&self, index: usize) -> Result<u64>;

    /// DRn に書き込む
    fn write(&mut self, index: usize, value: u64) -> Result<()>;
}

/// ptrace（PTRACE_PEEKUSER / PTRACE_POKEUSER）経由のデバッグレジスタアクセス
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub struct PtraceDebugRegisters {
    pid: nix::unistd::Pid,
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl PtraceDebugRegisters {
    /// デバッグレジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: nix::unistd::Pid::from_raw(pid),
        }
    }

    /// `struct user` 内の u_debugreg[index] のオフセット
    fn offset(index: usize) -> usize {
        std::mem::offset_of!(nix::libc::user, u_debugreg) + index * std::mem::size_of::<u64>()
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl DebugRegisterIo for PtraceDebugRegisters {
    fn read(&self, index: usize) -> Result<u64> {
        use nix::errno::Errno;
        use nix::libc;

        // PEEKUSER は -1 を正当な値として返しうるので errno で判定する
        Errno::clear();
        let value = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                self.pid.as_raw(),
                Self::offset(index) as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if value == -1 {
            let errno = Errno::last();
            if errno != Errno::UnknownErrno {
                return Err(anyhow::anyhow!(
                    "Failed to read DR{} of pid {}: {}",
                    index,
                    self.pid,
                    errno
                ));
            }
        }
        Ok(value as u64)
    }

    fn write(&mut self, index: usize, value: u64) -> Result<()> {
        use nix::errno::Errno;
        use nix::libc;

        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                self.pid.as_raw(),
                Self::offset(index) as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };
        Errno::result(ret).map_err(|errno| {
            anyhow::anyhow!(
                "Failed to write 0x{:x} to DR{} of pid {}: {}",
                value,
                index,
                self.pid,
                errno
            )
        })?;
        Ok(())
    }
}

/// メモリ上のデバッグレジスタファイル
///
/// プロセスを持たない状態でのウォッチ管理（テストやドライラン）に使います。
#[derive(Debug, Clone, Default)]
pub struct InMemoryDebugRegisters {
    regs: [u64; 8],
}

impl InMemoryDebugRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// DRn の現在値
    pub fn value(&self, index: usize) -> u64 {
        self.regs[index]
    }

    /// DRn を直接設定する（DR6 のヒットビットを模擬する場合など）
    pub fn set(&mut self, index: usize, value: u64) {
        self.regs[index] = value;
    }
}

impl DebugRegisterIo for InMemoryDebugRegisters {
    fn read(&self, index: usize) -> Result<u64> {
        self.regs
            .get(index)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("No such debug register DR{}", index))
    }

    fn write(&mut self, index: usize, value: u64) -> Result<()> {
        let reg = self
            .regs
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("No such debug register DR{}", index))?;
        *reg = value;
        Ok(())
    }
}

/// デバッグレジスタのスロット管理
pub struct DebugRegisters<Io> {
    io: Io,
    slots: [Option<WatchSlot>; MAX_WATCH_SLOTS],
}

impl<Io: DebugRegisterIo> DebugRegisters<Io> {
    /// スロット管理を作成する（レジスタには触れない）
    pub fn new(io: Io) -> Self {
        Self {
            io,
            slots: [None; MAX_WATCH_SLOTS],
        }
    }

    /// すべてのデバッグレジスタをゼロクリアする
    pub fn initialise(&mut self) -> Result<()> {
        self.slots = [None; MAX_WATCH_SLOTS];
        for i in 0..MAX_WATCH_SLOTS {
            self.io.write(i, 0)?;
        }
        self.io.write(DEBUG_STATUS_REG, 0)?;
        self.io.write(DEBUG_CONTROL_REG, 0)?;
        Ok(())
    }

    /// 現在のスロットから DR7 の値を計算する
    pub fn control(&self) -> u64 {
        let mut control = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                // validate_region 済みなので len_bits は失敗しない
                let len = len_bits(slot.size).unwrap_or(0);
                control |= 1 << dr7_enable_shift(i)
                    | slot.trigger.rw_bits() << dr7_rw_shift(i)
                    | len << dr7_len_shift(i);
            }
        }
        control
    }

    /// ウォッチを設定し、使用したスロット番号を返す
    pub fn set_watchpoint(&mut self, address: u64, size: usize, trigger: WatchTrigger) -> Result<usize> {
        validate_region(address, size)?;

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(DebugRegisterError::NoFreeSlots(address))?;

        // アドレスを先に書き、最後に DR7 で有効化する
        self.io.write(index, address)?;
        self.slots[index] = Some(WatchSlot { address, size, trigger });
        if let Err(e) = self.io.write(DEBUG_CONTROL_REG, self.control()) {
            self.slots[index] = None;
            return Err(e);
        }

        tracing::debug!("DR{} <- 0x{:x} (size {}, {:?})", index, address, size, trigger);
        Ok(index)
    }

    /// ウォッチを解除する
    pub fn unset_watchpoint(&mut self, index: usize) -> Result<()> {
        if self.slots.get(index).copied().flatten().is_none() {
            return Err(DebugRegisterError::EmptySlot(index).into());
        }

        self.slots[index] = None;
        self.io.write(DEBUG_CONTROL_REG, self.control())?;
        self.io.write(index, 0)?;
        Ok(())
    }

    /// DR7 と DR0-DR3 を読み取り、既に有効なスロットを取り込む
    ///
    /// 以前のセッションなど別の経路で設定されたウォッチを引き継ぐ場合に使います。
    /// 実行ブレークポイントや I/O ブレークポイントのスロットは無視します。
    /// 新たに取り込んだスロット番号を返します。
    pub fn load(&mut self) -> Result<Vec<usize>> {
        let control = self.io.read(DEBUG_CONTROL_REG)?;
        let mut loaded = Vec::new();

        for i in 0..MAX_WATCH_SLOTS {
            if self.slots[i].is_some() || control >> dr7_enable_shift(i) & 1 == 0 {
                continue;
            }

            let trigger = match control >> dr7_rw_shift(i) & 0b11 {
                0b01 => WatchTrigger::Write,
                0b11 => WatchTrigger::ReadWrite,
                _ => continue,
            };
            let size = match control >> dr7_len_shift(i) & 0b11 {
                0b00 => 1,
                0b01 => 2,
                0b11 => 4,
                _ => 8,
            };
            let address = self.io.read(i)?;

            self.slots[i] = Some(WatchSlot { address, size, trigger });
            loaded.push(i);
        }

        Ok(loaded)
    }

    /// スロットの内容を取得する
    pub fn slot(&self, index: usize) -> Option<&WatchSlot> {
        self.slots.get(index)?.as_ref()
    }

    /// 使用中のスロット数
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// 直前の停止でヒットしたスロットを DR6 から取得し、DR6 をクリアする
    pub fn triggered(&mut self) -> Result<Option<usize>> {
        let status = self.io.read(DEBUG_STATUS_REG)?;
        let hit = (status & 0xf) as u32;
        if hit == 0 {
            return Ok(None);
        }

        self.io.write(DEBUG_STATUS_REG, 0)?;
        let index = hit.trailing_zeros() as usize;
        // 解除済みスロットのビットは無視する
        Ok(self.slots[index].map(|_| index))
    }

    /// レジスタアクセスを取得する
    pub fn io(&self) -> &Io {
        &self.io
    }

    /// レジスタアクセスを可変参照で取得する
    pub fn io_mut(&mut self) -> &mut Io {
        &mut self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registers() -> DebugRegisters<InMemoryDebugRegisters> {
        DebugRegisters::new(InMemoryDebugRegisters::new())
    }

    #[test]
    fn test_dr7_encoding() {
        let mut regs = registers();
        let slot = regs.set_watchpoint(0x1000, 4, WatchTrigger::Write).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(regs.io().value(0), 0x1000);
        // L0=1, RW0=01, LEN0=11
        assert_eq!(regs.io().value(DEBUG_CONTROL_REG), 0b1 | 0b01 << 16 | 0b11 << 18);

        let slot = regs.set_watchpoint(0x2000, 8, WatchTrigger::ReadWrite).unwrap();
        assert_eq!(slot, 1);
        let control = regs.io().value(DEBUG_CONTROL_REG);
        assert_eq!(control >> 2 & 1, 1);
        assert_eq!(control >> 20 & 0b11, 0b11);
        assert_eq!(control >> 22 & 0b11, 0b10);
    }

    #[test]
    fn test_slots_exhausted() {
        let mut regs = registers();
        for i in 0..MAX_WATCH_SLOTS as u64 {
            regs.set_watchpoint(0x1000 + i * 8, 8, WatchTrigger::Write).unwrap();
        }
        let err = regs.set_watchpoint(0x3000, 4, WatchTrigger::Write).unwrap_err();
        assert!(err.to_string().contains("no free hardware watch slot"));
        assert_eq!(regs.in_use(), MAX_WATCH_SLOTS);
    }

    #[test]
    fn test_invalid_region() {
        let mut regs = registers();
        assert!(regs.set_watchpoint(0x1000, 3, WatchTrigger::Write).is_err());
        assert!(regs.set_watchpoint(0x1002, 4, WatchTrigger::Write).is_err());
        assert_eq!(regs.in_use(), 0);
        assert_eq!(regs.io().value(DEBUG_CONTROL_REG), 0);
    }

    #[test]
    fn test_unset_frees_slot() {
        let mut regs = registers();
        let a = regs.set_watchpoint(0x1000, 4, WatchTrigger::Write).unwrap();
        let b = regs.set_watchpoint(0x2000, 4, WatchTrigger::Write).unwrap();
        regs.unset_watchpoint(a).unwrap();
        assert_eq!(regs.io().value(DEBUG_CONTROL_REG) & 0b11, 0);
        assert!(regs.slot(b).is_some());
        assert!(regs.unset_watchpoint(a).is_err());

        // 空いたスロットが再利用される
        assert_eq!(regs.set_watchpoint(0x3000, 2, WatchTrigger::Write).unwrap(), a);
    }

    #[test]
    fn test_load_existing_slots() {
        let mut io = InMemoryDebugRegisters::new();
        io.set(2, 0x4000);
        // L2=1, RW2=11, LEN2=10（8バイト）
        io.set(DEBUG_CONTROL_REG, 1 << 4 | 0b11 << 24 | 0b10 << 26);
        // L3=1 だが RW3=00（実行ブレークポイント）
        io.set(3, 0x5000);
        io.set(DEBUG_CONTROL_REG, io.value(DEBUG_CONTROL_REG) | 1 << 6);

        let mut regs = DebugRegisters::new(io);
        assert_eq!(regs.load().unwrap(), vec![2]);
        assert_eq!(
            regs.slot(2),
            Some(&WatchSlot { address: 0x4000, size: 8, trigger: WatchTrigger::ReadWrite })
        );
        assert!(regs.slot(3).is_none());

        // 二度目は何も取り込まない
        assert!(regs.load().unwrap().is_empty());
    }

    #[test]
    fn test_triggered_reads_and_clears_dr6() {
        let mut regs = registers();
        regs.set_watchpoint(0x1000, 4, WatchTrigger::Write).unwrap();
        regs.set_watchpoint(0x2000, 4, WatchTrigger::Write).unwrap();

        assert_eq!(regs.triggered().unwrap(), None);

        regs.io_mut().set(DEBUG_STATUS_REG, 0b10);
        assert_eq!(regs.triggered().unwrap(), Some(1));
        assert_eq!(regs.io().value(DEBUG_STATUS_REG), 0);
    }
}
