//! The demand-paging allocator.
//!
//! A fixed frame table, a FIFO free list, and a FIFO victim queue; one
//! mutex serializes every public operation. Frames hold word arrays
//! (`mem_per_frame / 2` slots); text pages hold instruction handles, data
//! and heap pages hold 16-bit values.
//!
//! Replacement is FIFO with a pin bypass: the victim queue is rotated past
//! pinned frames, and since a pin only spans a single word access the queue
//! drains quickly. Eviction honors the dirty bit — an unwritten page is
//! dropped without touching the backing store, because its bytes are still
//! reproducible (from the process's initial image, or from the record a
//! previous dirty eviction left behind).
//!
//! The allocator holds PIDs, never process handles; owners are resolved
//! through the registry at eviction time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{debug, error};
use program::StoredWord;
use store::BackingStore;
use types::{Config, Pid, SimError, SimResult};

use crate::process::Process;
use crate::registry::ProcessRegistry;

const MAX_EVICTION_SPINS: usize = 1_000_000;

struct Frame {
    owner: Option<(Pid, usize)>,
    words: Vec<Option<StoredWord>>,
    pinned: bool,
    dirty: bool,
}

impl Frame {
    fn empty(frame_size: usize) -> Self {
        Self { owner: None, words: vec![None; frame_size / 2], pinned: false, dirty: false }
    }
}

struct FrameTable {
    frames: Vec<Frame>,
    free: VecDeque<usize>,
    victims: VecDeque<usize>,
}

/// Read-only view of one frame, for the frame-table display and tests.
#[derive(Clone, Copy, Debug)]
pub struct FrameView {
    pub owner: Option<(Pid, usize)>,
    pub pinned: bool,
    pub dirty: bool,
}

pub struct PagingAllocator {
    registry: Arc<ProcessRegistry>,
    store: BackingStore,
    frame_size: usize,
    total_frames: usize,
    inner: Mutex<FrameTable>,
    paged_in: AtomicU64,
    paged_out: AtomicU64,
}

impl PagingAllocator {
    /// Builds the frame table and truncates the backing store.
    pub fn new(config: &Config, registry: Arc<ProcessRegistry>) -> SimResult<Self> {
        let total_frames = config.num_frames();
        let frame_size = config.mem_per_frame;
        let store = BackingStore::create(&config.backing_store_path, frame_size)?;

        let frames = (0..total_frames).map(|_| Frame::empty(frame_size)).collect();
        debug!("paging allocator: {total_frames} frames of {frame_size} bytes");

        Ok(Self {
            registry,
            store,
            frame_size,
            total_frames,
            inner: Mutex::new(FrameTable {
                frames,
                free: (0..total_frames).collect(),
                victims: VecDeque::new(),
            }),
            paged_in: AtomicU64::new(0),
            paged_out: AtomicU64::new(0),
        })
    }

    /// Makes `(pid, page)` resident. On return the page sits unpinned in
    /// some frame and the process's page table points at it. May evict any
    /// unpinned frame, including one belonging to another process.
    pub fn handle_page_fault(&self, proc: &Process, page: usize) -> SimResult<()> {
        let pid = proc.pid();
        let entry = proc.page_entry(page).ok_or_else(|| {
            SimError::Internal(format!("page fault for pid {pid} on unmapped page {page}"))
        })?;
        if entry.valid {
            // Lost a race with our own earlier fault; nothing to do.
            return Ok(());
        }

        // Load the page image up front: from the swap file if the page has a
        // record, otherwise from the process's pristine contents. The store
        // read happens under the paging lock so it never observes a record
        // another core is still appending.
        let mut data = Some(if entry.in_backing_store {
            let _table = self.lock();
            self.store.read_page(pid, page)?
        } else {
            proc.initial_page_data(page)
        });

        let mut spins = 0;
        loop {
            {
                let mut table = self.lock();
                if let Some(frame) = table.free.pop_front() {
                    table.frames[frame] = Frame {
                        owner: Some((pid, page)),
                        words: data.take().expect("page image already consumed"),
                        pinned: false,
                        dirty: false,
                    };
                    table.victims.push_back(frame);
                    proc.swap_page_in(page, frame);
                    self.paged_in.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }

                if self.evict_one(&mut table)? {
                    // A frame just hit the free list; take it next pass.
                    continue;
                }
            }

            // Every candidate was pinned. Pins last one word access, so
            // yielding once is normally enough.
            spins += 1;
            if spins > MAX_EVICTION_SPINS {
                return Err(SimError::Internal(format!(
                    "pid {pid} page {page}: all frames stayed pinned"
                )));
            }
            thread::yield_now();
        }
    }

    /// FIFO victim selection with a pin bypass: rotate the queue once; the
    /// first unpinned frame goes out. Returns false when everything is
    /// pinned.
    fn evict_one(&self, table: &mut FrameTable) -> SimResult<bool> {
        for _ in 0..table.victims.len() {
            let frame_idx = table.victims.pop_front().expect("victim queue underflow");
            if table.frames[frame_idx].pinned {
                table.victims.push_back(frame_idx);
                continue;
            }

            let (pid, page) = table.frames[frame_idx]
                .owner
                .ok_or_else(|| SimError::Internal(format!("victim frame {frame_idx} is free")))?;
            let dirty = table.frames[frame_idx].dirty;

            let owner = self.registry.by_pid(pid).ok_or(SimError::UnknownPid(pid))?;
            owner.swap_page_out(page, dirty);

            if dirty {
                self.store.append_page(pid, page, &table.frames[frame_idx].words)?;
                self.paged_out.fetch_add(1, Ordering::Relaxed);
            }

            table.frames[frame_idx] = Frame::empty(self.frame_size);
            table.free.push_back(frame_idx);
            return Ok(true);
        }
        Ok(false)
    }

    /// Reserves `frame` for a single word access iff it still holds
    /// `(pid, page)`. A false return means the frame was reclaimed and the
    /// caller must fault again.
    pub fn pin_frame(&self, frame: usize, pid: Pid, page: usize) -> bool {
        let mut table = self.lock();
        if table.frames[frame].owner != Some((pid, page)) {
            return false;
        }
        table.frames[frame].pinned = true;
        true
    }

    /// Reads the word at byte `offset`, clearing the pin. An empty slot is
    /// a misaligned access and fatal.
    pub fn read_frame(&self, frame: usize, offset: usize) -> SimResult<StoredWord> {
        let mut table = self.lock();
        table.frames[frame].pinned = false;
        table.frames[frame].words[offset / 2]
            .clone()
            .ok_or(SimError::MisalignedAccess { frame, offset })
    }

    /// Writes a 16-bit value at byte `offset`, clearing the pin and marking
    /// the frame dirty.
    pub fn write_frame(&self, frame: usize, offset: usize, value: u16) -> SimResult<()> {
        let mut table = self.lock();
        let f = &mut table.frames[frame];
        f.pinned = false;
        f.dirty = true;
        f.words[offset / 2] = Some(StoredWord::Value(value));
        Ok(())
    }

    /// Releases everything a dead process held: its frames and its backing
    /// store records. Idempotent; callable from any thread.
    pub fn deallocate(&self, pid: Pid) -> SimResult<()> {
        {
            let mut table = self.lock();
            for idx in 0..table.frames.len() {
                if matches!(table.frames[idx].owner, Some((p, _)) if p == pid) {
                    table.frames[idx] = Frame::empty(self.frame_size);
                    table.victims.retain(|&v| v != idx);
                    table.free.push_back(idx);
                }
            }
        }
        self.store.remove_pid(pid)
    }

    // ---- statistics and inspection ---------------------------------------

    pub fn used_memory(&self) -> u64 {
        let table = self.lock();
        let used = table.frames.iter().filter(|f| f.owner.is_some()).count();
        (used * self.frame_size) as u64
    }

    pub fn total_memory(&self) -> u64 {
        (self.total_frames * self.frame_size) as u64
    }

    pub fn free_memory(&self) -> u64 {
        self.total_memory() - self.used_memory()
    }

    pub fn paged_in(&self) -> u64 {
        self.paged_in.load(Ordering::Relaxed)
    }

    pub fn paged_out(&self) -> u64 {
        self.paged_out.load(Ordering::Relaxed)
    }

    pub fn frame_views(&self) -> Vec<FrameView> {
        self.lock()
            .frames
            .iter()
            .map(|f| FrameView { owner: f.owner, pinned: f.pinned, dirty: f.dirty })
            .collect()
    }

    pub fn free_frames(&self) -> Vec<usize> {
        self.lock().free.iter().copied().collect()
    }

    pub fn backing_store_empty(&self) -> SimResult<bool> {
        self.store.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, FrameTable> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("paging mutex poisoned; continuing with the inner table");
                poisoned.into_inner()
            }
        }
    }
}
