//! Per-task heap (§3 "Heap", §4.8).
//!
//! Built on the published `rlsf` crate the way `r3_core::utils::alloc::rlsf`
//! is a vendored, const-eval-specialized copy of it — same `Tlsf` shape,
//! guarded here by our own [`Spinlock`] instead of a `const fn`-compatible
//! cell. Large requests cross over to `libc::mmap`/`munmap` on unix,
//! mirroring `r3_port_std`'s habit of dropping to raw `libc` calls wherever
//! the host OS is the only "port" that matters.

use std::alloc::Layout;
use std::cell::RefCell;
use std::collections::HashSet;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;
use rlsf::Tlsf;

use crate::sync::spinlock::Spinlock;

type TheTlsf = Tlsf<'static, u32, u32, 28, 32>;

bitflags! {
    /// Header flag bits (§4.8 "bits in the header word encode zero-fill and
    /// mmap flags").
    struct BlockFlags: u32 {
        const MMAP = 0b001;
        const ZERO_FILL = 0b010;
        const FAKE_HEADER = 0b100;
    }
}

/// Sits immediately before every pointer this heap hands out. For bucket
/// blocks `size` is the user-requested size; for `mmap` blocks it is the
/// total mapping length, needed to `munmap` correctly (§4.8).
#[repr(C)]
struct BlockHeader {
    size: usize,
    flags: BlockFlags,
}

/// Written by [`Heap::memalign`] in front of the over-aligned pointer it
/// returns; `offset` locates the real [`BlockHeader`] that precedes the
/// actual allocation start (§4.8 "`memalign` ... writes a fake header").
#[repr(C)]
struct FakeHeader {
    offset: u32,
    flags: BlockFlags,
}

const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

struct Inner {
    tlsf: TheTlsf,
    /// Addresses of every block currently outstanding, keyed the same way
    /// `deallocate` resolves a pointer back to its header. Checked before
    /// the real free runs so a re-free aborts instead of corrupting the
    /// allocator's freelist (§8 "double-free aborts").
    live: HashSet<usize>,
}

/// One arena a task's (or the bootstrap allocator's) allocations are drawn
/// from. Bucket blocks smaller than `mmap_threshold` come from `tlsf`'s
/// pool, extended on demand by leaking fresh `Vec<u8>` arenas into it
/// (§4.8 "split from an sbrk-managed arena via a per-heap extension lock");
/// larger ones are individually `mmap`'d.
pub struct Heap {
    inner: Spinlock<Inner>,
    mmap_threshold: usize,
}

impl Heap {
    pub fn new() -> Arc<Self> {
        Self::with_mmap_threshold(crate::config::config().default_mmap_start)
    }

    pub fn with_mmap_threshold(mmap_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Spinlock::new(Inner { tlsf: TheTlsf::new(), live: HashSet::new() }),
            mmap_threshold,
        })
    }

    /// Allocate `layout.size()` bytes with at least `layout.align()`
    /// alignment, zero-filled if `zero_fill`.
    pub fn allocate(&self, layout: Layout, zero_fill: bool) -> NonNull<u8> {
        if layout.size() >= self.mmap_threshold {
            self.allocate_mmap(layout, zero_fill)
        } else {
            self.allocate_bucket(layout, zero_fill)
        }
    }

    fn allocate_bucket(&self, layout: Layout, zero_fill: bool) -> NonNull<u8> {
        let header_layout = Layout::new::<BlockHeader>();
        let (full_layout, offset) = header_layout.extend(layout).expect("layout too large");
        let mut inner = self.inner.lock();
        let ptr = loop {
            if let Some(p) = inner.tlsf.allocate(full_layout) {
                break p;
            }
            let grown = full_layout.size().max(crate::config::config().default_heap_expansion);
            grow_pool(&mut inner.tlsf, grown);
        };
        inner.live.insert(ptr.as_ptr() as usize);
        unsafe {
            let header = ptr.as_ptr().cast::<BlockHeader>();
            header.write(BlockHeader {
                size: layout.size(),
                flags: if zero_fill { BlockFlags::ZERO_FILL } else { BlockFlags::empty() },
            });
            let user = ptr.as_ptr().add(offset);
            if zero_fill {
                user.write_bytes(0, layout.size());
            }
            NonNull::new_unchecked(user)
        }
    }

    #[cfg(unix)]
    fn allocate_mmap(&self, layout: Layout, zero_fill: bool) -> NonNull<u8> {
        let total = HEADER_SIZE + layout.size();
        let page = total.div_ceil(4096) * 4096;
        unsafe {
            let region = libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(region, libc::MAP_FAILED, "mmap failed for heap allocation");
            // mmap's pages are already zero-filled by the kernel; `flags`
            // records the request so `malloc_zero_fill` reports truthfully
            // regardless of how the page got that way.
            let header = region.cast::<BlockHeader>();
            let flags = BlockFlags::MMAP | if zero_fill { BlockFlags::ZERO_FILL } else { BlockFlags::empty() };
            header.write(BlockHeader { size: page, flags });
            self.inner.lock().live.insert(region as usize);
            NonNull::new_unchecked(region.cast::<u8>().add(HEADER_SIZE))
        }
    }

    #[cfg(not(unix))]
    fn allocate_mmap(&self, layout: Layout, zero_fill: bool) -> NonNull<u8> {
        log::warn!("mmap crossover unavailable on this platform; falling back to the bucket allocator");
        self.allocate_bucket(layout, zero_fill)
    }

    /// Over-allocate for `align` beyond what the bucket allocator natively
    /// supports, writing a [`FakeHeader`] in front of the returned pointer
    /// (§4.8 `memalign`).
    pub fn memalign(&self, align: usize, size: usize) -> NonNull<u8> {
        let worst_case = size + align + HEADER_SIZE + std::mem::size_of::<FakeHeader>();
        let raw = self.allocate(Layout::from_size_align(worst_case, 1).expect("memalign layout"), false);
        unsafe {
            let raw_addr = raw.as_ptr() as usize;
            let aligned_addr = (raw_addr + std::mem::size_of::<FakeHeader>() + align - 1) & !(align - 1);
            let fake = (aligned_addr - std::mem::size_of::<FakeHeader>()) as *mut FakeHeader;
            fake.write(FakeHeader {
                offset: (aligned_addr - std::mem::size_of::<FakeHeader>() - raw_addr) as u32,
                flags: BlockFlags::FAKE_HEADER,
            });
            NonNull::new_unchecked(aligned_addr as *mut u8)
        }
    }

    /// Free a pointer previously returned by [`Heap::allocate`] or
    /// [`Heap::memalign`]. # Safety: `ptr` must have come from this heap and
    /// not already be freed.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let (block_ptr, _fake) = self.resolve_block(ptr);
        if !self.inner.lock().live.remove(&(block_ptr as usize)) {
            crate::uc_abort!("double free detected at {:p}", block_ptr);
        }
        let header = &*block_ptr.cast::<BlockHeader>();
        if header.flags.contains(BlockFlags::MMAP) {
            self.deallocate_mmap(block_ptr, header.size);
        } else {
            let mut inner = self.inner.lock();
            let align = std::mem::align_of::<BlockHeader>();
            inner.tlsf.deallocate(NonNull::new_unchecked(block_ptr), align);
        }
    }

    #[cfg(unix)]
    unsafe fn deallocate_mmap(&self, block_ptr: *mut u8, mapped_size: usize) {
        libc::munmap(block_ptr.cast(), mapped_size);
    }

    #[cfg(not(unix))]
    unsafe fn deallocate_mmap(&self, block_ptr: *mut u8, _mapped_size: usize) {
        let mut inner = self.inner.lock();
        let align = std::mem::align_of::<BlockHeader>();
        inner.tlsf.deallocate(NonNull::new_unchecked(block_ptr), align);
    }

    /// Resolve `ptr` (possibly behind a memalign fake header) back to the
    /// real block's start.
    unsafe fn resolve_block(&self, ptr: NonNull<u8>) -> (*mut u8, bool) {
        let user_addr = ptr.as_ptr() as usize;
        let probe = (user_addr - std::mem::size_of::<FakeHeader>()) as *const FakeHeader;
        if (*probe).flags.contains(BlockFlags::FAKE_HEADER) {
            let block_addr = user_addr - std::mem::size_of::<FakeHeader>() - (*probe).offset as usize - HEADER_SIZE;
            (block_addr as *mut u8, true)
        } else {
            ((user_addr - HEADER_SIZE) as *mut u8, false)
        }
    }

    /// # Safety: `ptr` must be live and from this heap.
    pub unsafe fn malloc_usable_size(&self, ptr: NonNull<u8>) -> usize {
        let (block_ptr, _) = self.resolve_block(ptr);
        (*block_ptr.cast::<BlockHeader>()).size
    }

    /// # Safety: `ptr` must be live and from this heap.
    pub unsafe fn malloc_zero_fill(&self, ptr: NonNull<u8>) -> bool {
        let (block_ptr, _) = self.resolve_block(ptr);
        (*block_ptr.cast::<BlockHeader>()).flags.contains(BlockFlags::ZERO_FILL)
    }
}

fn grow_pool(tlsf: &mut TheTlsf, min_size: usize) {
    let arena_size = min_size + HEADER_SIZE + 64;
    let arena: &'static mut [MaybeUninit<u8>] = Box::leak(Box::new_uninit_slice(arena_size));
    tlsf.insert_free_block(arena);
}

thread_local! {
    static CURRENT_HEAP: RefCell<Option<Arc<Heap>>> = const { RefCell::new(None) };
}

/// The heap affinity of the task running on this OS thread, creating a
/// fresh heap on first use ("callable from very early in bootstrap", §4.8 —
/// here, before any explicit heap is installed).
pub fn current_heap() -> Arc<Heap> {
    CURRENT_HEAP.with(|c| {
        let mut slot = c.borrow_mut();
        if slot.is_none() {
            *slot = Some(Heap::new());
        }
        Arc::clone(slot.as_ref().unwrap())
    })
}

/// Bind this OS thread (a task's thread-of-control) to `heap` for all
/// subsequent `current_heap()` calls — the translator-generated task-start
/// code would call this once, matching §4.8's per-task `heapData` pointer.
pub fn set_current_heap(heap: Arc<Heap>) {
    CURRENT_HEAP.with(|c| *c.borrow_mut() = Some(heap));
}
