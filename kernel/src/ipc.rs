//! Message ports
//!
//! FIFO ports carrying framed messages between application threads and the
//! application server. Senders block (yielding) when a port is full, which
//! gives the GUI send buffer its backpressure.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::{Mutex, RwLock};

use crate::vfs::{ErrorCode, KResult};

pub type PortId = u32;

pub const INVALID_PORT: PortId = 0;

/// One framed message: a 16-bit code and its payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub code: u16,
    pub data: Vec<u8>,
}

struct Port {
    #[allow(dead_code)]
    name: String,
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    closed: AtomicBool,
}

static PORTS: RwLock<BTreeMap<PortId, Arc<Port>>> = RwLock::new(BTreeMap::new());
static NEXT_PORT: AtomicU32 = AtomicU32::new(1);

pub fn create_port(name: &str, capacity: usize) -> PortId {
    let id = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
    let port = Arc::new(Port {
        name: String::from(name),
        queue: Mutex::new(VecDeque::new()),
        capacity,
        closed: AtomicBool::new(false),
    });
    PORTS.write().insert(id, port);
    id
}

pub fn delete_port(id: PortId) {
    if let Some(port) = PORTS.write().remove(&id) {
        port.closed.store(true, Ordering::Release);
    }
}

fn lookup(id: PortId) -> KResult<Arc<Port>> {
    PORTS.read().get(&id).cloned().ok_or(ErrorCode::NotFound)
}

/// Send, blocking while the port is full.
pub fn send(id: PortId, code: u16, data: &[u8]) -> KResult<()> {
    let port = lookup(id)?;
    loop {
        if port.closed.load(Ordering::Acquire) {
            return Err(ErrorCode::NoDevice);
        }
        {
            let mut queue = port.queue.lock();
            if queue.len() < port.capacity {
                queue.push_back(Message { code, data: data.to_vec() });
                return Ok(());
            }
        }
        crate::scheduler::yield_now();
    }
}

/// Blocking receive.
pub fn receive(id: PortId) -> KResult<Message> {
    let port = lookup(id)?;
    loop {
        if let Some(message) = port.queue.lock().pop_front() {
            return Ok(message);
        }
        if port.closed.load(Ordering::Acquire) {
            return Err(ErrorCode::NoDevice);
        }
        crate::scheduler::yield_now();
    }
}

/// Receive with a deadline. `TimedOut` when nothing arrived in time.
pub fn receive_timeout(id: PortId, ms: u64) -> KResult<Message> {
    let port = lookup(id)?;
    let deadline = crate::time::Deadline::after_ms(ms);
    loop {
        if let Some(message) = port.queue.lock().pop_front() {
            return Ok(message);
        }
        if port.closed.load(Ordering::Acquire) {
            return Err(ErrorCode::NoDevice);
        }
        if deadline.expired() {
            return Err(ErrorCode::TimedOut);
        }
        crate::scheduler::yield_now();
    }
}

/// Non-blocking receive.
pub fn try_receive(id: PortId) -> KResult<Message> {
    let port = lookup(id)?;
    let result = match port.queue.lock().pop_front() {
        Some(message) => Ok(message),
        None => Err(ErrorCode::WouldBlock),
    };
    result
}
