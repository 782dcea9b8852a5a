//! Timeout-bounded execution of blocking disk operations.
//!
//! Each operation runs on a worker thread and the caller waits on a
//! completion slot with a deadline. Three outcomes:
//!
//! - **success**: the buffer (with data, for reads) comes back to the caller.
//! - **error**: the op failed immediately; the buffer comes back too.
//! - **timeout**: the deadline passed with the op still in the kernel. The
//!   caller gets `AioTimeout` and the buffer stays with the worker; when
//!   the op eventually drains the worker drops the buffer and returns to
//!   the idle pool. A worker stuck in a syscall therefore never blocks an
//!   unrelated operation — submission just spawns a fresh worker when the
//!   idle pool is empty.

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moorlock_error::{MoorError, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::buffer::AlignedBuf;
use crate::traits::DiskHandle;

/// Workers kept around after finishing a job.
const MAX_IDLE_WORKERS: usize = 8;

enum Outcome {
    Pending,
    Done(AlignedBuf, std::io::Result<()>),
    /// Caller timed out and walked away; the worker drops the buffer.
    Abandoned,
    /// Worker took the final result after abandonment (buffer dropped).
    Drained,
}

struct Completion {
    state: Mutex<Outcome>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Outcome::Pending),
            cond: Condvar::new(),
        })
    }

    /// Worker side: deliver the finished op.
    fn finish(&self, buf: AlignedBuf, res: std::io::Result<()>) {
        let mut state = self.state.lock();
        match *state {
            Outcome::Abandoned => {
                // The caller is gone; reclaim the buffer here, which is the
                // only point the leaked allocation may be freed.
                *state = Outcome::Drained;
                drop(state);
                drop(buf);
            }
            _ => {
                *state = Outcome::Done(buf, res);
                drop(state);
                self.cond.notify_one();
            }
        }
    }

    /// Caller side: wait until `deadline`.
    fn wait(&self, deadline: Instant) -> Option<(AlignedBuf, std::io::Result<()>)> {
        let mut state = self.state.lock();
        loop {
            if let Outcome::Done(..) = *state {
                let done = std::mem::replace(&mut *state, Outcome::Drained);
                let Outcome::Done(buf, res) = done else { unreachable!() };
                return Some((buf, res));
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                // Late completion still wins if it raced the deadline.
                if let Outcome::Done(..) = *state {
                    continue;
                }
                *state = Outcome::Abandoned;
                return None;
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct Inner {
    idle: Mutex<Vec<Sender<Job>>>,
}

/// Shared dispatcher for all disk operations of one runtime.
#[derive(Clone)]
pub struct IoDispatcher {
    inner: Arc<Inner>,
}

impl Default for IoDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    fn submit(&self, job: Job) {
        let worker = self.inner.idle.lock().pop();
        match worker {
            Some(tx) => {
                if let Err(returned) = tx.send(job) {
                    // The worker exited between being pooled and now.
                    self.spawn_worker(returned.0);
                }
            }
            None => self.spawn_worker(job),
        }
    }

    fn spawn_worker(&self, first: Job) {
        let (tx, rx) = channel::<Job>();
        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("moorlock-io".into())
            .spawn(move || {
                first();
                loop {
                    {
                        let mut idle = inner.idle.lock();
                        if idle.len() >= MAX_IDLE_WORKERS {
                            break;
                        }
                        idle.push(tx.clone());
                    }
                    match rx.recv() {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                }
            })
            .expect("spawn io worker");
    }

    /// Read `len` bytes at `offset` into a fresh aligned buffer.
    pub fn read_iobuf(
        &self,
        disk: &DiskHandle,
        offset: u64,
        len: usize,
        timeout_seconds: u32,
    ) -> Result<AlignedBuf> {
        let mut buf = AlignedBuf::zeroed(len);
        let completion = Completion::new();
        let worker_side = Arc::clone(&completion);
        let disk = Arc::clone(disk);
        self.submit(Box::new(move || {
            let res = disk.pread(offset, buf.as_mut_slice());
            worker_side.finish(buf, res);
        }));
        self.await_outcome(completion, timeout_seconds)
            .map(|(buf, ())| buf)
    }

    /// Write the whole buffer at `offset`. The buffer comes back on
    /// success and error, but not on timeout.
    pub fn write_iobuf(
        &self,
        disk: &DiskHandle,
        offset: u64,
        buf: AlignedBuf,
        timeout_seconds: u32,
    ) -> Result<AlignedBuf> {
        let completion = Completion::new();
        let worker_side = Arc::clone(&completion);
        let disk = Arc::clone(disk);
        self.submit(Box::new(move || {
            let res = disk.pwrite(offset, buf.as_slice());
            worker_side.finish(buf, res);
        }));
        self.await_outcome(completion, timeout_seconds)
            .map(|(buf, ())| buf)
    }

    fn await_outcome(
        &self,
        completion: Arc<Completion>,
        timeout_seconds: u32,
    ) -> Result<(AlignedBuf, ())> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(timeout_seconds));
        match completion.wait(deadline) {
            Some((buf, Ok(()))) => Ok((buf, ())),
            Some((_, Err(e))) => Err(MoorError::Io(e)),
            None => {
                warn!(timeout_seconds, "disk op timed out; buffer abandoned to worker");
                Err(MoorError::AioTimeout { timeout_seconds })
            }
        }
    }

    /// Read `count` whole sectors starting at sector `index`.
    pub fn read_sectors(
        &self,
        disk: &DiskHandle,
        index: u64,
        count: usize,
        timeout_seconds: u32,
    ) -> Result<AlignedBuf> {
        let ss = u64::from(disk.sector_size());
        debug!(index, count, disk = %disk.describe(), "read_sectors");
        self.read_iobuf(
            disk,
            index * ss,
            count * usize::try_from(ss).expect("sector size fits usize"),
            timeout_seconds,
        )
    }

    /// Write one record into sector `index`: the record bytes are placed at
    /// the start of a zeroed sector-sized buffer.
    pub fn write_sector(
        &self,
        disk: &DiskHandle,
        index: u64,
        record: &[u8],
        timeout_seconds: u32,
    ) -> Result<()> {
        let ss = usize::try_from(disk.sector_size()).expect("sector size fits usize");
        assert!(record.len() <= ss, "record larger than a sector");
        let mut buf = AlignedBuf::zeroed(ss);
        buf[..record.len()].copy_from_slice(record);
        self.write_iobuf(disk, index * u64::from(disk.sector_size()), buf, timeout_seconds)
            .map(drop)
    }
}
