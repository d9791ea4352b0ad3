//! ホストのスレッドでカーネルを動かすテスト用プラットフォーム
//!
//! CPUとカーネルスレッドをそれぞれホストのスレッドに対応させ、
//! コンテキストスイッチはバトンの受け渡しで表す。各CPUで同時に動くのは
//! バトンを持つ1スレッドだけ。タイマーは1ティック = 1ミリ秒。
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use mochios_task::hal::{AddressSpace, AddressSpaces, Arch, ImageLoader, Smp, StackRegion, Timer, TimerHandle};
use mochios_task::task::{Context, CpuId, Entry, KernelEntry, ThreadId, ThreadState};
use mochios_task::error::ElfError;
use mochios_task::{Config, KernelError, ProcessManager};
use x86_64::{PhysAddr, VirtAddr};

pub type Pm = ProcessManager<Arc<HostPlatform>>;

/// 起動済みのカーネル
pub struct Kernel {
    pub pm: Pm,
    pub platform: Arc<HostPlatform>,
}

thread_local! {
    static CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
    static KERNEL: RefCell<Option<Arc<Kernel>>> = const { RefCell::new(None) };
}

fn enter(cpu: Option<CpuId>, kernel: Arc<Kernel>) {
    CPU.with(|c| c.set(cpu));
    KERNEL.with(|k| *k.borrow_mut() = Some(kernel));
}

/// 呼び出し元のスレッドが動いているカーネル
pub fn kernel() -> Arc<Kernel> {
    KERNEL.with(|k| k.borrow().clone()).expect("not running inside a kernel thread")
}

#[derive(Default)]
struct Baton {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    fn grant(&self) {
        *self.granted.lock().unwrap() = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut granted = self.granted.lock().unwrap();
        while !*granted {
            granted = self.cv.wait(granted).unwrap();
        }
        *granted = false;
    }
}

pub struct HostPlatform {
    kernel: OnceLock<Weak<Kernel>>,
    batons: Mutex<HashMap<ThreadId, Arc<Baton>>>,
    entries: Mutex<HashMap<ThreadId, Entry>>,
    started: Mutex<HashSet<ThreadId>>,
    timers: Arc<Mutex<HashSet<TimerHandle>>>,
    next_timer: AtomicU64,
    next_space: AtomicU64,
    next_stack: AtomicU64,
    next_cpu: AtomicUsize,
    shutdown: AtomicBool,
    /// タイムアウトでスレッドを起こした回数
    timeouts: Arc<Mutex<HashMap<ThreadId, usize>>>,
    /// カーネルスレッド内で起きたパニック
    pub failures: Mutex<Vec<String>>,
}

impl HostPlatform {
    fn new() -> Self {
        Self {
            kernel: OnceLock::new(),
            batons: Mutex::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            started: Mutex::new(HashSet::new()),
            timers: Arc::new(Mutex::new(HashSet::new())),
            next_timer: AtomicU64::new(1),
            next_space: AtomicU64::new(1),
            next_stack: AtomicU64::new(0),
            next_cpu: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            timeouts: Arc::new(Mutex::new(HashMap::new())),
            failures: Mutex::new(Vec::new()),
        }
    }

    fn kernel(&self) -> Arc<Kernel> {
        self.kernel.get().and_then(Weak::upgrade).expect("kernel dropped")
    }

    fn baton(&self, thread: ThreadId) -> Arc<Baton> {
        self.batons.lock().unwrap().entry(thread).or_default().clone()
    }

    fn fail(&self, message: String) {
        eprintln!("kernel thread failed: {}", message);
        self.failures.lock().unwrap().push(message);
    }

    /// 初めて切り替えられたカーネルスレッドをホストのスレッドで開始する
    fn start_if_new(&self, cpu: CpuId, thread: ThreadId) {
        if !self.started.lock().unwrap().insert(thread) {
            return;
        }
        let Some(entry) = self.entries.lock().unwrap().get(&thread).copied() else {
            // アイドルスレッドはCPUをアタッチしたスレッドそのもの
            return;
        };
        let Entry::Kernel { func, arg } = entry else {
            self.fail(format!("{:?}: user mode entries cannot run on the host", thread));
            return;
        };

        let kernel = self.kernel();
        let baton = self.baton(thread);
        std::thread::spawn(move || {
            enter(Some(cpu), kernel.clone());
            baton.wait();
            let code = match catch_unwind(AssertUnwindSafe(|| func(arg))) {
                Ok(code) => code,
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    kernel.platform.fail(format!("{:?}: {}", thread, message));
                    -1
                }
            };
            kernel.pm.exit_current(code);
        });
    }

    /// `thread` がタイムアウトで起こされた回数
    pub fn timeouts_of(&self, thread: ThreadId) -> usize {
        self.timeouts.lock().unwrap().get(&thread).copied().unwrap_or(0)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl AddressSpaces for HostPlatform {
    fn kernel_space(&self) -> AddressSpace {
        AddressSpace::new(PhysAddr::new(0x1000))
    }

    fn create_space(&self) -> Result<AddressSpace, KernelError> {
        let n = self.next_space.fetch_add(1, Ordering::SeqCst);
        Ok(AddressSpace::new(PhysAddr::new(0x1000 + n * 0x1000)))
    }

    fn destroy_space(&self, _space: AddressSpace) {}

    fn allocate_stack(&self, _space: AddressSpace, size: usize) -> Result<StackRegion, KernelError> {
        let n = self.next_stack.fetch_add(1, Ordering::SeqCst);
        Ok(StackRegion::new(VirtAddr::new(0x1000_0000 + n * 0x10_0000), size))
    }

    fn free_stack(&self, _space: AddressSpace, _stack: StackRegion) {}

    fn activate(&self, _space: AddressSpace) {}
}

impl Timer for HostPlatform {
    fn ticks_for(&self, duration: Duration) -> u64 {
        duration.as_millis() as u64
    }

    fn arm(&self, ticks: u64, thread: ThreadId) -> TimerHandle {
        let handle = TimerHandle::new(self.next_timer.fetch_add(1, Ordering::SeqCst));
        self.timers.lock().unwrap().insert(handle);

        let timers = self.timers.clone();
        let fired = self.timeouts.clone();
        let kernel = self.kernel.get().cloned().unwrap_or_default();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(ticks));
            if !timers.lock().unwrap().remove(&handle) {
                return;
            }
            if let Some(kernel) = kernel.upgrade() {
                if kernel.pm.expire_timer(handle) {
                    *fired.lock().unwrap().entry(thread).or_default() += 1;
                }
            }
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.timers.lock().unwrap().remove(&handle)
    }
}

impl ImageLoader for HostPlatform {
    fn load(&self, path: &str, _space: AddressSpace) -> Result<VirtAddr, KernelError> {
        eprintln!("no image loader on the host: {}", path);
        Err(ElfError::NotFound.into())
    }
}

impl Smp for HostPlatform {
    fn current_cpu(&self) -> CpuId {
        CPU.with(Cell::get).unwrap_or(CpuId::new(u32::MAX))
    }

    fn send_ipi(&self, _cpu: CpuId) {}

    fn select_cpu(&self, online: &[CpuId]) -> CpuId {
        if online.is_empty() {
            return self.current_cpu();
        }
        online[self.next_cpu.fetch_add(1, Ordering::SeqCst) % online.len()]
    }
}

impl Arch for HostPlatform {
    fn init_context(
        &self,
        thread: ThreadId,
        entry: Entry,
        stack: &StackRegion,
        space: AddressSpace,
    ) -> Context {
        self.entries.lock().unwrap().insert(thread, entry);
        Context::for_entry(&entry, stack, space)
    }

    unsafe fn switch_context(
        &self,
        cpu: CpuId,
        from: Option<ThreadId>,
        _save: *mut Context,
        to: ThreadId,
        _context: &Context,
    ) {
        self.start_if_new(cpu, to);
        self.baton(to).grant();
        if let Some(from) = from {
            self.baton(from).wait();
        }
    }

    fn exit_context(&self, cpu: CpuId, to: ThreadId, _context: &Context) -> ! {
        self.start_if_new(cpu, to);
        self.baton(to).grant();
        loop {
            std::thread::park();
        }
    }

    fn halt(&self, _cpu: CpuId) {
        if self.shutdown.load(Ordering::SeqCst) {
            loop {
                std::thread::park();
            }
        }
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// 割り込みからの復帰を模す（ティックを進め、要求と再スケジュールを処理）
pub fn interrupt_point() {
    let kernel = kernel();
    kernel.pm.tick().unwrap();
    kernel.pm.validate_state().unwrap();
    std::thread::yield_now();
}

/// すべてのCPUがアタッチされるまで待つ
fn wait_for_cpus(kernel: &Kernel) {
    while kernel.pm.online_cpus().len() < kernel.pm.config().max_cpus {
        kernel.pm.sleep_for("boot", Duration::from_millis(1)).unwrap();
    }
}

/// カーネルプロセスにスレッドを作る（CPUは順番に割り当てられる）
pub fn spawn(name: &str, func: KernelEntry, arg: usize) -> ThreadId {
    let kernel = kernel();
    wait_for_cpus(&kernel);
    let process = kernel.pm.kernel_process().unwrap();
    kernel.pm.create_thread(process, name, Entry::Kernel { func, arg }, None).unwrap()
}

/// スレッドがすべて終了するまで眠りながら待ち、終了コードを返す
pub fn join(threads: &[ThreadId], timeout: Duration) -> Vec<i32> {
    let kernel = kernel();
    let deadline = Instant::now() + timeout;
    loop {
        let infos: Vec<_> = threads.iter().map(|t| kernel.pm.thread_info(*t).unwrap()).collect();
        if infos.iter().all(|i| i.state == ThreadState::Terminated) {
            return infos.iter().map(|i| i.exit_code.unwrap()).collect();
        }
        assert!(Instant::now() < deadline, "threads did not finish: {:?}", infos);
        kernel.pm.sleep_for("join", Duration::from_millis(5)).unwrap();
    }
}

/// `cpus` 個のCPUを起動し、CPU 0 のカーネルプロセスで `main` を実行する
pub fn boot(cpus: usize, main: KernelEntry) -> Arc<Kernel> {
    let platform = Arc::new(HostPlatform::new());
    let config = Config::new().with_max_cpus(cpus).with_pid_limit(1024);
    let pm = ProcessManager::new(config, platform.clone()).unwrap();
    let kernel = Arc::new(Kernel { pm, platform });
    let _ = kernel.platform.kernel.set(Arc::downgrade(&kernel));

    for cpu in 0..cpus {
        let k = kernel.clone();
        let id = CpuId::new(cpu as u32);
        std::thread::spawn(move || {
            enter(Some(id), k.clone());
            let entry = (cpu == 0).then_some((main, 0));
            if let Err(e) = k.pm.attach_cpu(entry) {
                k.platform.fail(format!("CPU {} stopped: {}", cpu, e));
            }
        });
        // main はCPU 0 のカーネルプロセスの最初のスレッド
        let deadline = Instant::now() + Duration::from_secs(5);
        while kernel.pm.online_cpus().len() <= cpu {
            assert!(Instant::now() < deadline, "CPU {} did not attach", cpu);
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    kernel
}

/// `main` を実行し、終了コード 0 で終わることを確認する
pub fn run(cpus: usize, main: KernelEntry, timeout: Duration) {
    let kernel = boot(cpus, main);
    let deadline = Instant::now() + timeout;
    let main_thread = loop {
        let process = kernel.pm.kernel_process().and_then(|p| kernel.pm.process_info(p).ok());
        if let Some(main) = process.and_then(|p| p.main_thread) {
            break main;
        }
        assert!(Instant::now() < deadline, "main thread was not created");
        std::thread::sleep(Duration::from_millis(1));
    };

    loop {
        let info = kernel.pm.thread_info(main_thread).unwrap();
        if info.state == ThreadState::Terminated {
            assert_eq!(info.exit_code, Some(0));
            break;
        }
        assert!(Instant::now() < deadline, "main did not finish: {:?}", info);
        std::thread::sleep(Duration::from_millis(10));
    }

    kernel.platform.shutdown();
    let failures = kernel.platform.failures.lock().unwrap().clone();
    assert!(failures.is_empty(), "kernel threads failed: {:?}", failures);
}
