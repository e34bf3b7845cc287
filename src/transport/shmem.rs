//! Multi-process transport over POSIX shared memory on a single machine.
//!
//! Rank 0 creates one shared segment holding a bootstrap [`SharedState`] and the message
//! slots, then re-launches the current executable once per worker. Children find the segment through the environment and claim ranks
//! `1..size` atomically.
//!
//! Every ordered pair has one slot per [`Tag`], so channels never wait on each other and
//! a receiver may ask for tags in any order. A slot holds one fragment at a time. The
//! sender writes the fragment, marks it valid and spins until the receiver acknowledges;
//! payloads larger than the slot are streamed as several fragments, each carrying how
//! many bytes are still to come. While waiting on one tag, a receiver keeps draining
//! the sender's other slots into a private inbox.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};
use shared_memory::{Shmem, ShmemConf};

use super::{check_peer, deadline, Tag, Transport};
use crate::error::{MatMulError, Result};

/// Upper bound on participants; sizes the bootstrap arrays.
pub const MAX_PROCS: usize = 32;

/// Set in a spawned child's environment to the segment's flink path.
const SEGMENT_ENV: &str = "MATMUL_SHMEM_SEGMENT";

const HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();
const STATE_SIZE: usize = std::mem::size_of::<SharedState>();

static SEGMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[repr(C)]
struct SlotHeader {
    valid: AtomicBool,
    received: AtomicBool,
    len: AtomicUsize,
    remaining: AtomicUsize,
}

#[repr(C)]
struct SharedState {
    size: AtomicUsize,
    slot_bytes: AtomicUsize,
    process_ids: [AtomicUsize; MAX_PROCS],
    init_flags: [AtomicBool; MAX_PROCS],
    cleanup_ready: [AtomicBool; MAX_PROCS],
}

/// One process's endpoint in a shared-memory world.
pub struct ShmemTransport {
    rank: i32,
    size: i32,
    slot_bytes: usize,
    timeout: Option<Duration>,
    shmem: Shmem,
    children: Vec<Child>,
    inbox: Mutex<Inbox>,
}

/// Frames drained from slots other than the one being waited on.
#[derive(Default)]
struct Inbox {
    partial: HashMap<(i32, Tag), Vec<u8>>,
    ready: HashMap<(i32, Tag), VecDeque<Vec<u8>>>,
}

impl ShmemTransport {
    /// Join or create the shared-memory world.
    ///
    /// In the launching process this creates the segment, spawns `size - 1` copies of the
    /// current executable with the same arguments, and becomes rank 0. In a spawned copy
    /// it attaches to the existing segment and claims a free rank. Either way it returns
    /// only once every rank has attached.
    ///
    /// `timeout` bounds start-up, every send acknowledgement and shutdown.
    ///
    /// ```rust,no_run
    /// use rowblock_matmul::transport::{ShmemTransport, Transport};
    ///
    /// let world = ShmemTransport::init(4, 1 << 20, None).unwrap();
    /// println!("Process {} of {}", world.rank(), world.size());
    /// world.finalize().unwrap();
    /// ```
    pub fn init(size: i32, slot_bytes: usize, timeout: Option<Duration>) -> Result<Self> {
        if let Some(path) = std::env::var_os(SEGMENT_ENV) {
            return Self::join(Path::new(&path), size, timeout);
        }

        let mut world = Self::create(size, slot_bytes, timeout)?;
        world.spawn_children()?;
        world.wait_for_ranks()?;
        Ok(world)
    }

    fn create(size: i32, slot_bytes: usize, timeout: Option<Duration>) -> Result<Self> {
        if size <= 0 || size as usize > MAX_PROCS {
            return Err(MatMulError::InvalidConfiguration(format!(
                "shared-memory world size must be in 1..={MAX_PROCS}, got {size}"
            )));
        }
        if slot_bytes == 0 {
            return Err(MatMulError::InvalidConfiguration(
                "slot size must be positive".into(),
            ));
        }

        // Keep every header 8-byte aligned.
        let slot_bytes = slot_bytes.next_multiple_of(8);
        let slots = slot_count(size);
        let total_size = STATE_SIZE + slots * (HEADER_SIZE + slot_bytes);

        let flink = std::env::temp_dir().join(format!(
            "rowblock_matmul_{}_{}",
            std::process::id(),
            SEGMENT_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        debug!("Creating shared memory of size {} at {:?}", total_size, flink);

        let shmem = ShmemConf::new()
            .size(total_size)
            .flink(&flink)
            .create()
            .map_err(|e| MatMulError::SharedMemoryError(e.to_string()))?;

        // All-zero is a valid initial state for every atomic in the segment: no message
        // pending, no rank claimed.
        unsafe {
            std::ptr::write_bytes(shmem.as_ptr(), 0, total_size);
        }

        let world = ShmemTransport {
            rank: 0,
            size,
            slot_bytes,
            timeout,
            shmem,
            children: Vec::new(),
            inbox: Mutex::default(),
        };
        let state = world.state();
        state.size.store(size as usize, Ordering::SeqCst);
        state.slot_bytes.store(slot_bytes, Ordering::SeqCst);
        state.process_ids[0].store(std::process::id() as usize, Ordering::SeqCst);
        state.init_flags[0].store(true, Ordering::SeqCst);

        debug!("Parent process initialized as rank 0");
        Ok(world)
    }

    fn join(path: &Path, size: i32, timeout: Option<Duration>) -> Result<Self> {
        debug!("Spawned process attaching to {:?}", path);

        let shmem = ShmemConf::new()
            .flink(path)
            .open()
            .map_err(|e| MatMulError::SharedMemoryError(e.to_string()))?;
        if shmem.len() < STATE_SIZE {
            return Err(MatMulError::SharedMemoryError(format!(
                "segment {:?} is only {} bytes",
                path,
                shmem.len()
            )));
        }

        let pid = std::process::id() as usize;
        let (rank, slot_bytes) = {
            let state = state_of(&shmem);
            let world_size = state.size.load(Ordering::SeqCst);
            if world_size != size as usize {
                return Err(MatMulError::InvalidConfiguration(format!(
                    "segment was created for {world_size} processes, this process expects {size}"
                )));
            }

            // Try to claim a rank by atomically setting its process ID from 0 to ours
            let rank = (1..world_size)
                .find(|&i| {
                    state.process_ids[i]
                        .compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                })
                .ok_or_else(|| {
                    MatMulError::ProcessError(format!("no available ranks for process {pid}"))
                })?;
            state.init_flags[rank].store(true, Ordering::SeqCst);
            (rank, state.slot_bytes.load(Ordering::SeqCst))
        };

        let world = ShmemTransport {
            rank: rank as i32,
            size,
            slot_bytes,
            timeout,
            shmem,
            children: Vec::new(),
            inbox: Mutex::default(),
        };

        debug!("Process {} initialized as rank {}", pid, rank);
        world.wait_for_ranks()?;
        Ok(world)
    }

    fn spawn_children(&mut self) -> Result<()> {
        let exe = std::env::current_exe().map_err(|e| MatMulError::ProcessError(e.to_string()))?;
        let path = self.flink_path()?;
        for _ in 1..self.size {
            let child = Command::new(&exe)
                .args(std::env::args_os().skip(1))
                .env(SEGMENT_ENV, &path)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| MatMulError::ProcessError(e.to_string()))?;
            debug!("Spawned process {}", child.id());
            self.children.push(child);
        }
        Ok(())
    }

    fn wait_for_ranks(&self) -> Result<()> {
        let state = self.state();
        let size = self.size as usize;
        let ready = wait_until(deadline(self.timeout), || {
            state.init_flags[..size]
                .iter()
                .all(|f| f.load(Ordering::SeqCst))
        });
        if !ready {
            return Err(MatMulError::ProcessError(format!(
                "rank {} gave up waiting for {} processes to start",
                self.rank, size
            )));
        }
        Ok(())
    }

    fn flink_path(&self) -> Result<PathBuf> {
        self.shmem
            .get_flink_path()
            .cloned()
            .ok_or_else(|| MatMulError::SharedMemoryError("segment has no flink path".into()))
    }

    /// Synchronize shutdown and release the segment.
    ///
    /// Every rank marks itself finished; rank 0 additionally waits for all other ranks
    /// to do the same and reaps its child processes before unlinking the segment.
    pub fn finalize(mut self) -> Result<()> {
        let state = self.state();
        state.cleanup_ready[self.rank as usize].store(true, Ordering::SeqCst);

        if self.rank == 0 {
            debug!("Parent process waiting for children to finish");
            let size = self.size as usize;
            let all_done = wait_until(deadline(self.timeout), || {
                state.cleanup_ready[..size]
                    .iter()
                    .all(|f| f.load(Ordering::SeqCst))
            });
            if !all_done {
                return Err(MatMulError::ProcessError(
                    "workers did not reach shutdown".into(),
                ));
            }
            for mut child in std::mem::take(&mut self.children) {
                child
                    .wait()
                    .map_err(|e| MatMulError::ProcessError(e.to_string()))?;
            }
        }

        debug!("Process {} finished", self.rank);
        Ok(())
    }

    fn state(&self) -> &SharedState {
        state_of(&self.shmem)
    }

    fn slot_ptr(&self, src: i32, dst: i32, tag: Tag) -> *mut u8 {
        let pair = (src * self.size + dst) as usize;
        let slot_index = pair * Tag::ALL.len() + tag.as_i32() as usize;
        let slot_size = HEADER_SIZE + self.slot_bytes;
        unsafe { self.shmem.as_ptr().add(STATE_SIZE + slot_index * slot_size) }
    }

    fn header(&self, slot: *mut u8) -> &SlotHeader {
        unsafe { &*(slot as *const SlotHeader) }
    }
}

impl Transport for ShmemTransport {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    /// Blocks until the receiver has acknowledged every fragment.
    fn send(&self, dest: i32, tag: Tag, payload: &[u8]) -> Result<()> {
        check_peer(self.rank, self.size, dest)?;
        debug!(
            "Rank {} sending {} bytes to rank {} on {}",
            self.rank,
            payload.len(),
            dest,
            tag
        );

        let slot = self.slot_ptr(self.rank, dest, tag);
        let header = self.header(slot);
        let timeout = || MatMulError::Timeout { peer: dest, tag };

        let mut sent = 0;
        loop {
            let end = (sent + self.slot_bytes).min(payload.len());
            let fragment = &payload[sent..end];

            // Wait for slot to be free
            if !wait_until(deadline(self.timeout), || !header.valid.load(Ordering::SeqCst)) {
                return Err(timeout());
            }

            header.len.store(fragment.len(), Ordering::SeqCst);
            header.remaining.store(payload.len() - end, Ordering::SeqCst);
            header.received.store(false, Ordering::SeqCst);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    fragment.as_ptr(),
                    slot.add(HEADER_SIZE),
                    fragment.len(),
                );
            }
            header.valid.store(true, Ordering::SeqCst);

            if !wait_until(deadline(self.timeout), || header.received.load(Ordering::SeqCst)) {
                return Err(timeout());
            }

            sent = end;
            if sent >= payload.len() {
                break;
            }
        }

        debug!("Rank {} completed send to rank {}", self.rank, dest);
        Ok(())
    }

    fn recv(&self, source: i32, tag: Tag, timeout: Option<Duration>) -> Result<Vec<u8>> {
        check_peer(self.rank, self.size, source)?;
        debug!("Rank {} receiving from rank {} on {}", self.rank, source, tag);

        let deadline = deadline(timeout);
        let mut inbox = self.inbox.lock().map_err(|_| {
            MatMulError::CommunicationError(format!("inbox of rank {} poisoned", self.rank))
        })?;

        let mut spins = 0;
        let frame = loop {
            if let Some(frame) = inbox
                .ready
                .get_mut(&(source, tag))
                .and_then(VecDeque::pop_front)
            {
                break frame;
            }
            if self.drain(&mut inbox, source)? {
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(MatMulError::Timeout { peer: source, tag });
            }
            backoff(&mut spins);
        };

        debug!("Rank {} completed receive from rank {}", self.rank, source);
        Ok(frame)
    }
}

impl ShmemTransport {
    /// Take every pending fragment from `source`, on any tag. Returns whether any was taken.
    fn drain(&self, inbox: &mut Inbox, source: i32) -> Result<bool> {
        let mut progressed = false;
        for tag in Tag::ALL {
            let slot = self.slot_ptr(source, self.rank, tag);
            let header = self.header(slot);
            if !header.valid.load(Ordering::SeqCst) {
                continue;
            }

            let len = header.len.load(Ordering::SeqCst);
            let remaining = header.remaining.load(Ordering::SeqCst);
            if len > self.slot_bytes {
                return Err(MatMulError::CommunicationError(format!(
                    "fragment of {len} bytes exceeds slot size {}",
                    self.slot_bytes
                )));
            }
            let frame = inbox.partial.entry((source, tag)).or_default();
            if frame.is_empty() {
                frame.reserve_exact(len + remaining);
            }
            let data = unsafe { std::slice::from_raw_parts(slot.add(HEADER_SIZE), len) };
            frame.extend_from_slice(data);

            // Acknowledge receipt and mark slot as free
            header.received.store(true, Ordering::SeqCst);
            header.valid.store(false, Ordering::SeqCst);
            progressed = true;

            if remaining == 0 {
                let frame = inbox.partial.remove(&(source, tag)).unwrap_or_default();
                inbox.ready.entry((source, tag)).or_default().push_back(frame);
            }
        }
        Ok(progressed)
    }
}

impl Drop for ShmemTransport {
    fn drop(&mut self) {
        // Children still attached here means the run was abandoned before finalize.
        for child in &mut self.children {
            warn!("Terminating worker process {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// One slot per ordered pair and tag.
fn slot_count(size: i32) -> usize {
    size as usize * size as usize * Tag::ALL.len()
}

fn state_of(shmem: &Shmem) -> &SharedState {
    unsafe { &*(shmem.as_ptr() as *const SharedState) }
}

/// Spin until `ready` holds or `deadline` passes. Returns whether `ready` held.
fn wait_until(deadline: Option<Instant>, mut ready: impl FnMut() -> bool) -> bool {
    let mut spins = 0;
    while !ready() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        backoff(&mut spins);
    }
    true
}

fn backoff(spins: &mut u32) {
    *spins = spins.wrapping_add(1);
    if *spins % 1024 == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::coordinator::Coordinator;
    use crate::kernel::{multiply, NaiveKernel};
    use crate::matrix::Matrix;
    use crate::worker::Worker;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

    #[test]
    fn wait_until_honours_deadline() {
        let start = Instant::now();
        assert!(!wait_until(deadline(Some(Duration::from_millis(20))), || false));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(wait_until(None, || true));
    }

    #[test]
    fn layout_keeps_headers_aligned() {
        assert_eq!(HEADER_SIZE % 8, 0);
        assert_eq!(STATE_SIZE % 8, 0);
    }

    #[test]
    fn rejects_bad_world_sizes() {
        assert!(ShmemTransport::create(0, 64, TIMEOUT).is_err());
        assert!(ShmemTransport::create(MAX_PROCS as i32 + 1, 64, TIMEOUT).is_err());
        assert!(ShmemTransport::create(2, 0, TIMEOUT).is_err());
    }

    #[test]
    fn streams_payloads_larger_than_a_slot() {
        let root = ShmemTransport::create(2, 64, TIMEOUT).unwrap();
        let path = root.flink_path().unwrap();

        let worker = std::thread::spawn(move || {
            let me = ShmemTransport::join(&path, 2, TIMEOUT)?;
            assert_eq!(me.rank(), 1);
            let first = me.recv(0, Tag::RowBlock, TIMEOUT)?;
            let second = me.recv(0, Tag::Offset, TIMEOUT)?;
            me.send(0, Tag::PartialBlock, &first)?;
            me.finalize()?;
            Ok::<_, MatMulError>(second)
        });

        root.wait_for_ranks().unwrap();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        root.send(1, Tag::RowBlock, &payload).unwrap();
        root.send(1, Tag::Offset, &[]).unwrap();
        let echoed = root.recv(1, Tag::PartialBlock, TIMEOUT).unwrap();
        assert_eq!(echoed, payload);

        let empty = worker.join().unwrap().unwrap();
        assert!(empty.is_empty());
        root.finalize().unwrap();
    }

    #[test]
    fn tags_can_be_received_out_of_send_order() {
        let root = ShmemTransport::create(2, 64, TIMEOUT).unwrap();
        let path = root.flink_path().unwrap();

        let worker = std::thread::spawn(move || {
            let me = ShmemTransport::join(&path, 2, TIMEOUT)?;
            let offset = me.recv(0, Tag::Offset, TIMEOUT)?;
            let block = me.recv(0, Tag::RowBlock, TIMEOUT)?;
            me.finalize()?;
            Ok::<_, MatMulError>((offset, block))
        });

        root.wait_for_ranks().unwrap();
        let block: Vec<u8> = (0..200u8).collect();
        root.send(1, Tag::RowBlock, &block).unwrap();
        root.send(1, Tag::Offset, &[7, 0, 0, 0]).unwrap();

        let (offset, received) = worker.join().unwrap().unwrap();
        assert_eq!(offset, vec![7, 0, 0, 0]);
        assert_eq!(received, block);
        root.finalize().unwrap();
    }

    #[test]
    fn coordinator_and_workers_over_shared_memory() {
        let root = ShmemTransport::create(4, 64, TIMEOUT).unwrap();
        let path = root.flink_path().unwrap();

        let workers: Vec<_> = (1..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let me = ShmemTransport::join(&path, 4, TIMEOUT)?;
                    Worker::new(&me, NaiveKernel, TIMEOUT).run()?;
                    me.finalize()
                })
            })
            .collect();

        root.wait_for_ranks().unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let a = Matrix::random(13, 7, &mut rng);
        let b = Matrix::random(7, 5, &mut rng);
        let c = Coordinator::new(&root, NaiveKernel, Duration::from_secs(10))
            .run(&a, &b)
            .unwrap();
        assert!(c.approx_eq(&multiply(&a, &b).unwrap(), 1e-12));

        for w in workers {
            w.join().unwrap().unwrap();
        }
        root.finalize().unwrap();
    }

    #[test]
    fn worker_that_never_receives_is_unresponsive() {
        let root = ShmemTransport::create(2, 64, Some(Duration::from_millis(200))).unwrap();
        let path = root.flink_path().unwrap();
        let (joined_tx, joined_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        // Attaches to the segment, then stays silent until the run is over.
        let silent = std::thread::spawn(move || {
            let _me = ShmemTransport::join(&path, 2, TIMEOUT).unwrap();
            joined_tx.send(()).unwrap();
            let _ = done_rx.recv();
        });

        joined_rx.recv().unwrap();
        root.wait_for_ranks().unwrap();
        let m = Matrix::zeros(4, 4);
        let err = Coordinator::new(&root, NaiveKernel, Duration::from_millis(200))
            .run(&m, &m)
            .unwrap_err();
        assert!(matches!(
            err,
            MatMulError::WorkerUnresponsive { worker: 1, channel: Tag::Broadcast }
        ));

        done_tx.send(()).unwrap();
        silent.join().unwrap();
    }

    #[test]
    fn recv_times_out_without_sender() {
        let root = ShmemTransport::create(2, 64, TIMEOUT).unwrap();
        let err = root
            .recv(1, Tag::PartialBlock, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, MatMulError::Timeout { peer: 1, tag: Tag::PartialBlock }));
    }
}
