//! タスク管理モジュール
//!
//! マルチタスク機能を提供（プロセスとスレッドの管理、CPUごとのスケジューリング、
//! スリープ/ウェイクアップ）

pub mod context;
pub mod ids;
pub mod manager;
pub mod pid;
pub mod process;
pub mod runqueue;
pub mod table;
pub mod thread;
pub mod wait;

pub use context::{Context, Entry, KernelEntry};
pub use ids::{
    Channel, CpuId, PrivilegeLevel, ProcessId, ProcessState, TaskId, ThreadId, ThreadState,
    WakeReason,
};
pub use manager::{ProcessImage, ProcessInfo, ProcessManager, ThreadInfo};
pub use process::{Process, StreamHandle};
pub use runqueue::RunqueueStats;
pub use thread::{ErrorCause, ErrorRecord, FaultCode, Severity, Thread};
