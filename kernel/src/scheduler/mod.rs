//! Preemptive scheduler
//!
//! Round-robin over kernel threads sharing the address space. Context
//! switching runs through PendSV on the Cortex-M target; the host build
//! (tests) degrades to a cooperative stub where `yield_now` advances the
//! clock so timeout loops stay deterministic.

mod task;

pub use task::{Thread, ThreadState, Tid};

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

struct Scheduler {
    threads: BTreeMap<Tid, Thread>,
    ready: VecDeque<Tid>,
    current: Tid,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            current: 0,
        }
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Register the boot thread and start the tick source.
pub fn init() {
    let tid = alloc_tid();
    let mut sched = SCHEDULER.lock();
    sched.threads.insert(tid, Thread::bootstrap(tid));
    sched.current = tid;
    drop(sched);

    #[cfg(target_arch = "arm")]
    arch::start_systick();

    crate::log!("[sched] scheduler online, boot thread {}", tid);
}

fn alloc_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::SeqCst)
}

/// Spawn a kernel thread. On the host build the thread body is retained but
/// only runs when explicitly driven, which is all the test suite needs.
pub fn spawn(name: &str, entry: fn()) -> Tid {
    let tid = alloc_tid();
    let thread = Thread::new(tid, String::from(name), entry);
    let mut sched = SCHEDULER.lock();
    sched.threads.insert(tid, thread);
    sched.ready.push_back(tid);
    drop(sched);
    crate::log_debug!("[sched] spawned '{}' as thread {}", name, tid);
    tid
}

pub fn current_tid() -> Tid {
    SCHEDULER.lock().current
}

/// Give up the CPU. Safe to call from polling loops.
pub fn yield_now() {
    #[cfg(target_arch = "arm")]
    arch::trigger_pendsv();
    #[cfg(not(target_arch = "arm"))]
    {
        // Host stub: make time pass so deadline polls terminate.
        crate::time::tick();
        core::hint::spin_loop();
    }
}

/// Sleep the calling thread for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    let deadline = crate::time::Deadline::after_ms(ms);
    while !deadline.expired() {
        yield_now();
    }
}

/// Timer tick hook, called from the SysTick handler.
pub fn on_tick() {
    crate::time::tick();
}

/// Pick the next ready thread, returning its saved stack pointer.
/// Called from the PendSV handler with the outgoing PSP.
#[cfg(target_arch = "arm")]
fn switch_context(current_psp: u32) -> u32 {
    let mut sched = SCHEDULER.lock();
    let current = sched.current;
    if let Some(thread) = sched.threads.get_mut(&current) {
        thread.saved_psp = current_psp;
        if thread.state == ThreadState::Running {
            thread.state = ThreadState::Ready;
            sched.ready.push_back(current);
        }
    }
    if let Some(next) = sched.ready.pop_front() {
        sched.current = next;
        let thread = sched.threads.get_mut(&next).unwrap();
        thread.state = ThreadState::Running;
        return thread.saved_psp;
    }
    current_psp
}

/// Remove the calling thread. Does not return on hardware.
pub fn exit_current() {
    let mut sched = SCHEDULER.lock();
    let current = sched.current;
    if let Some(thread) = sched.threads.get_mut(&current) {
        thread.state = ThreadState::Dead;
    }
    drop(sched);
    loop {
        yield_now();
    }
}

// ============================================================================
// Cortex-M context switch
// ============================================================================

#[cfg(target_arch = "arm")]
mod arch {
    use core::arch::global_asm;

    /// SysTick at 1 kHz drives preemption and the uptime clock.
    pub fn start_systick() {
        // SYST registers: CSR @ E000E010, RVR @ E000E014
        const SYST_CSR: *mut u32 = 0xE000_E010 as *mut u32;
        const SYST_RVR: *mut u32 = 0xE000_E014 as *mut u32;
        const CORE_HZ: u32 = 300_000_000;
        unsafe {
            core::ptr::write_volatile(SYST_RVR, CORE_HZ / 1000 - 1);
            core::ptr::write_volatile(SYST_CSR, 0b111); // enable | tickint | cpu clock
        }
    }

    pub fn trigger_pendsv() {
        const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
        const PENDSVSET: u32 = 1 << 28;
        unsafe {
            core::ptr::write_volatile(ICSR, PENDSVSET);
        }
        cortex_m::asm::isb();
    }

    #[no_mangle]
    extern "C" fn systick_tick() {
        super::on_tick();
        trigger_pendsv();
    }

    #[no_mangle]
    extern "C" fn scheduler_switch_context(psp: u32) -> u32 {
        super::switch_context(psp)
    }

    // PendSV: save r4-r11 on the outgoing process stack, ask the scheduler
    // for the next thread, restore its registers and return through the
    // exception frame.
    global_asm!(
        ".section .text.PendSV",
        ".global PendSV",
        ".thumb_func",
        "PendSV:",
        "    mrs r0, psp",
        "    stmdb r0!, {{r4-r11}}",
        "    push {{lr}}",
        "    bl scheduler_switch_context",
        "    pop {{lr}}",
        "    ldmia r0!, {{r4-r11}}",
        "    msr psp, r0",
        "    bx lr",
        ".global SysTick",
        ".thumb_func",
        "SysTick:",
        "    push {{lr}}",
        "    bl systick_tick",
        "    pop {{pc}}",
    );
}
