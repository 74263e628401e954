// src/kernel/process/mod.rs
//! Process management module
//!
//! This module provides process structure and lifecycle management
//! for user-mode processes.

use x86_64::structures::paging::{PhysFrame, PageTable, FrameAllocator, FrameDeallocator, Size4KiB};
use x86_64::VirtAddr;
use alloc::vec::Vec;
use alloc::sync::Arc;
use alloc::alloc::{alloc_zeroed, Layout};
use spin::Mutex;
use lazy_static::lazy_static;

pub mod lifecycle;
pub mod switch;

pub use lifecycle::{create_user_process, terminate_current, terminate_process};
pub use switch::context_switch;

pub use crate::kernel::core::types::{Priority, ThreadId};

/// Process ID type.
///
/// One thread runs per process in this kernel: `ThreadId` and `ProcessId`
/// share a numeric space (the process's sole thread reuses its PID as TID),
/// so the process table below doubles as the thread registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Create a new process ID
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// This process's sole thread.
    #[must_use]
    pub const fn thread_id(self) -> ThreadId {
        ThreadId(self.0)
    }
}

/// Process (thread) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Currently executing on a CPU.
    Running,
    /// Runnable, waiting on a scheduler runqueue.
    Ready,
    /// Waiting on a syscall/IPC result; not runnable until woken.
    Blocked,
    /// Waiting on a timer; woken once it expires.
    Sleeping,
    /// Exited but not yet reaped by its parent.
    Terminated,
}

/// Saved register state for context switching
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RegisterState {
    /// General purpose registers
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    
    /// Program counter
    pub rip: u64,
    
    /// Flags register
    pub rflags: u64,
}

impl Default for RegisterState {
    fn default() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0x202, // Default: IF (interrupt flag) set
        }
    }
}

/// Process control block
pub struct Process {
    /// Process ID
    pid: ProcessId,
    
    /// Current state
    state: ProcessState,
    
    /// Page table physical frame
    /// Note: We store the physical frame instead of a reference
    /// to avoid lifetime issues
    page_table_frame: PhysFrame,
    
    /// Kernel stack (for syscall handling)
    kernel_stack: VirtAddr,
    
    /// User stack  
    user_stack: VirtAddr,
    
    /// Saved CPU state for context switching
    saved_registers: RegisterState,

    /// Saved kernel stack pointer for context switching
    /// This holds the RSP when the process is switched out
    context_rsp: u64,

    /// Parent Process ID
    parent_pid: Option<ProcessId>,

    /// Exit code (if terminated)
    exit_code: Option<i32>,

    /// Top of mmap allocation (bump allocator)
    mmap_top: VirtAddr,

    /// Scheduling priority.
    priority: Priority,

    /// Signals not yet delivered (bit N set = signal N pending).
    signal_pending: u64,

    /// Signals blocked from delivery (bit N set = signal N masked).
    signal_mask: u64,

    /// Open file/socket descriptor table, indexed by fd number.
    descriptors: Vec<Option<Descriptor>>,

    /// Next fd number to try when allocating (bump, with reuse of holes).
    next_fd: usize,

    /// `true` while a kernel worker is actively running this thread's
    /// queued syscall handler.
    syscall_busy: bool,

    /// `true` while this thread's syscall request is linked into the
    /// queued-path request list. Invariant: `syscall_busy` and
    /// `syscall_queued` are never both true for a `Blocked` thread.
    syscall_queued: bool,
}

bitflags::bitflags! {
    /// The IODescriptor flag bits the data model requires: two close
    /// semantics (on `exec`, on `fork`), three write/blocking modes, and
    /// the two sync variants. Shared by file and socket descriptors alike
    /// so `fcntl` has one flag set regardless of descriptor kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u32 {
        const CLOEXEC  = crate::kernel::config::O_CLOEXEC;
        const CLOFORK  = crate::kernel::config::O_CLOFORK;
        const APPEND   = crate::kernel::config::O_APPEND;
        const NONBLOCK = crate::kernel::config::O_NONBLOCK;
        const SYNC     = crate::kernel::config::O_SYNC;
        const DSYNC    = crate::kernel::config::O_DSYNC;
    }
}

/// Shared, refcounted state behind a `File` descriptor: the Router's
/// opaque handle plus the byte position `lseek` and the read/write fast
/// path operate on. `fork()` shares this object between parent and child
/// (bumping `refcount`); `close` releases it at zero.
pub struct FileState {
    pub handle: u64,
    pub position: u64,
    pub refcount: usize,
}

impl FileState {
    #[must_use]
    pub fn new(handle: u64) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self { handle, position: 0, refcount: 1 }))
    }
}

/// What a descriptor table entry refers to: either a file resolved
/// through the Router, or a kernel-resident socket.
#[derive(Clone)]
pub enum DescriptorKind {
    File(Arc<Mutex<FileState>>),
    Socket(crate::kernel::socket::SocketId),
}

/// An entry in a process's descriptor table.
#[derive(Clone)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    pub flags: IoFlags,
}

impl Descriptor {
    #[must_use]
    pub fn file(handle: u64, flags: IoFlags) -> Self {
        Self { kind: DescriptorKind::File(FileState::new(handle)), flags }
    }

    #[must_use]
    pub const fn socket(id: crate::kernel::socket::SocketId) -> Self {
        Self { kind: DescriptorKind::Socket(id), flags: IoFlags::empty() }
    }

    #[must_use]
    pub const fn socket_id(&self) -> Option<crate::kernel::socket::SocketId> {
        match self.kind {
            DescriptorKind::Socket(id) => Some(id),
            DescriptorKind::File(_) => None,
        }
    }

    #[must_use]
    pub fn file_state(&self) -> Option<Arc<Mutex<FileState>>> {
        match &self.kind {
            DescriptorKind::File(state) => Some(state.clone()),
            DescriptorKind::Socket(_) => None,
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        use crate::kernel::mm::allocator::BOOT_INFO_ALLOCATOR;
        // use x86_64::structures::paging::FrameDeallocator; // Trait imported but not used? Wait, deallocate_frame needs it.

        // Free page table frame
        let mut allocator_lock = BOOT_INFO_ALLOCATOR.lock();
        if let Some(frame_allocator) = allocator_lock.as_mut() {
            unsafe {
                frame_allocator.deallocate_frame(self.page_table_frame);
            }
        }
        
        // TODO: Free kernel stack
        // TODO: Free all user pages (requires walking the page table)
        
        crate::debug_println!("[Process] Dropped PID={} (Freed page table frame)", self.pid.as_u64());
    }
}

impl Process {
    /// Create a new process from a loaded program
    ///
    /// This is a convenience constructor that creates a process from
    /// a `LoadedProgram` returned by the loader.
    ///
    /// # Arguments
    /// * `pid` - Process ID
    /// * `page_table_frame` - Physical frame containing the process's page table
    /// * `kernel_stack` - Virtual address of the kernel stack
    /// * `loaded_program` - Information about the loaded program
    #[must_use]
    pub fn from_loaded_program(
        pid: ProcessId,
        page_table_frame: PhysFrame,
        kernel_stack: VirtAddr,
        loaded_program: &crate::kernel::loader::LoadedProgram,
    ) -> Self {
        Self::new(
            pid,
            page_table_frame,
            kernel_stack,
            loaded_program.stack_top,
            loaded_program.entry_point,
        )
    }
    
    /// Create a new process
    ///
    /// # Arguments
    /// * `pid` - Process ID
    /// * `page_table_frame` - Physical frame containing the process's page table
    /// * `kernel_stack` - Virtual address of the kernel stack
    /// * `user_stack` - Virtual address of the user stack
    /// * `entry_point` - Virtual address where execution should start
    #[must_use]
    #[allow(clippy::field_reassign_with_default)] // Intentional: selective initialization
    pub fn new(
        pid: ProcessId,
        page_table_frame: PhysFrame,
        kernel_stack: VirtAddr,
        user_stack: VirtAddr,
        entry_point: VirtAddr,
    ) -> Self {
        let mut registers = RegisterState::default();
        registers.rip = entry_point.as_u64();
        registers.rsp = user_stack.as_u64();
        
        Self {
            pid,
            state: ProcessState::Ready,
            page_table_frame,
            kernel_stack,
            user_stack,
            saved_registers: registers,
            context_rsp: 0, // Will be set during context switch
            parent_pid: None,
            exit_code: None,
            mmap_top: VirtAddr::new(0x0000_0010_0000_0000), // Start mmap at 64GB
            priority: Priority::Normal,
            signal_pending: 0,
            signal_mask: 0,
            descriptors: Vec::new(),
            next_fd: 0,
            syscall_busy: false,
            syscall_queued: false,
        }
    }

    /// Whether a kernel worker is currently running this thread's queued
    /// syscall handler.
    #[must_use]
    pub const fn syscall_busy(&self) -> bool {
        self.syscall_busy
    }

    pub const fn set_syscall_busy(&mut self, busy: bool) {
        self.syscall_busy = busy;
    }

    /// Whether this thread's syscall request is currently linked into the
    /// queued-path request list.
    #[must_use]
    pub const fn syscall_queued(&self) -> bool {
        self.syscall_queued
    }

    pub const fn set_syscall_queued(&mut self, queued: bool) {
        self.syscall_queued = queued;
    }

    /// Allocate the lowest free fd number for `descriptor`.
    pub fn alloc_fd(&mut self, descriptor: Descriptor) -> u32 {
        for (fd, slot) in self.descriptors.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(descriptor);
                return fd as u32;
            }
        }
        self.descriptors.push(Some(descriptor));
        (self.descriptors.len() - 1) as u32
    }

    /// Look up an open descriptor by fd number.
    #[must_use]
    pub fn get_fd(&self, fd: u32) -> Option<Descriptor> {
        self.descriptors.get(fd as usize).and_then(|slot| slot.clone())
    }

    /// Overwrite an already-open descriptor's entry (used by `fcntl`).
    /// Returns `false` if `fd` isn't open.
    pub fn set_fd(&mut self, fd: u32, descriptor: Descriptor) -> bool {
        match self.descriptors.get_mut(fd as usize) {
            Some(slot @ Some(_)) => {
                *slot = Some(descriptor);
                true
            }
            _ => false,
        }
    }

    /// Close `fd`, dropping the shared `FileState`'s refcount (releasing
    /// it at zero) and freeing the slot for reuse. Returns `false` if it
    /// wasn't open.
    pub fn close_fd(&mut self, fd: u32) -> bool {
        match self.descriptors.get_mut(fd as usize) {
            Some(slot @ Some(_)) => {
                if let Some(Descriptor { kind: DescriptorKind::File(state), .. }) = slot.take() {
                    state.lock().refcount -= 1;
                }
                true
            }
            _ => false,
        }
    }

    /// Snapshot the descriptor table for `fork()`: a `File` descriptor's
    /// shared state has its refcount bumped (S3's shared-fd semantics);
    /// any descriptor flagged `CLOFORK` is dropped instead of inherited.
    #[must_use]
    pub fn fork_descriptors(&self) -> (Vec<Option<Descriptor>>, usize) {
        let inherited = self
            .descriptors
            .iter()
            .map(|slot| {
                slot.as_ref().and_then(|d| {
                    if d.flags.contains(IoFlags::CLOFORK) {
                        None
                    } else {
                        if let DescriptorKind::File(state) = &d.kind {
                            state.lock().refcount += 1;
                        }
                        Some(d.clone())
                    }
                })
            })
            .collect();
        (inherited, self.next_fd)
    }

    /// Install a descriptor table snapshot taken by `fork_descriptors`.
    pub fn set_file_descriptors(&mut self, descriptors: Vec<Option<Descriptor>>, next_fd: usize) {
        self.descriptors = descriptors;
        self.next_fd = next_fd;
    }

    /// Drop every descriptor flagged `CLOEXEC` from the table, releasing
    /// the underlying `FileState` refcount. Called by `exec()`, which
    /// otherwise preserves the descriptor table unchanged.
    pub fn close_exec_descriptors(&mut self) {
        for slot in &mut self.descriptors {
            let should_close = matches!(slot, Some(d) if d.flags.contains(IoFlags::CLOEXEC));
            if should_close {
                if let Some(Descriptor { kind: DescriptorKind::File(state), .. }) = slot.take() {
                    state.lock().refcount -= 1;
                }
            }
        }
    }

    /// Get scheduling priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Set scheduling priority.
    pub const fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Mark `signal` pending for this process's thread.
    pub fn raise_signal(&mut self, signal: u8) {
        self.signal_pending |= 1u64 << (signal as u64 & 63);
    }

    /// Take the next pending, unmasked signal, clearing it.
    pub fn take_pending_signal(&mut self) -> Option<u8> {
        let deliverable = self.signal_pending & !self.signal_mask;
        if deliverable == 0 {
            return None;
        }
        let signal = deliverable.trailing_zeros() as u8;
        self.signal_pending &= !(1u64 << signal);
        Some(signal)
    }

    /// Get the signal mask.
    #[must_use]
    pub const fn signal_mask(&self) -> u64 {
        self.signal_mask
    }

    /// Set the signal mask.
    pub const fn set_signal_mask(&mut self, mask: u64) {
        self.signal_mask = mask;
    }
    
    /// Get process ID
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }
    
    /// Get current state
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }
    
    /// Set process state
    pub const fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }
    
    /// Get page table frame
    #[must_use]
    pub const fn page_table_frame(&self) -> PhysFrame {
        self.page_table_frame
    }
    
    /// Get kernel stack pointer
    #[must_use]
    pub const fn kernel_stack(&self) -> VirtAddr {
        self.kernel_stack
    }
    
    /// Get user stack pointer
    #[must_use]
    pub const fn user_stack(&self) -> VirtAddr {
        self.user_stack
    }
    
    /// Get saved registers
    #[must_use]
    pub const fn registers(&self) -> &RegisterState {
        &self.saved_registers
    }
    
    /// Get mutable saved registers
    pub const fn registers_mut(&mut self) -> &mut RegisterState {
        &mut self.saved_registers
    }

    /// Get mutable reference to context RSP
    pub fn context_rsp_mut(&mut self) -> &mut u64 {
        &mut self.context_rsp
    }

    /// Get context RSP
    pub const fn context_rsp(&self) -> u64 {
        self.context_rsp
    }

    /// Update process image (for exec)
    pub fn update_image(&mut self, page_table_frame: PhysFrame, user_stack: VirtAddr, _entry_point: VirtAddr) {
        self.page_table_frame = page_table_frame;
        self.user_stack = user_stack;
        // Note: entry_point is not stored in Process, it's in registers.rip
        // But we update it here for completeness if we add it later.
        // Actually, we update registers in exec_process.
    }

    /// Get parent PID
    pub fn parent_pid(&self) -> Option<ProcessId> {
        self.parent_pid
    }

    /// Set parent PID
    pub fn set_parent_pid(&mut self, pid: ProcessId) {
        self.parent_pid = Some(pid);
    }

    /// Get exit code
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Set exit code
    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    /// Get mmap top
    pub fn mmap_top(&self) -> VirtAddr {
        self.mmap_top
    }

    /// Set mmap top
    pub fn set_mmap_top(&mut self, addr: VirtAddr) {
        self.mmap_top = addr;
    }
}

/// Process table - manages all processes in the system
pub struct ProcessTable {
    processes: Vec<Process>,
    next_pid: u64,
    current_pid: Option<ProcessId>,
}

impl ProcessTable {
    /// Create a new empty process table
    #[must_use]
    #[allow(clippy::new_without_default)] // Intentional: explicit new() for clarity
    pub const fn new() -> Self {
        Self {
            processes: Vec::new(),
            next_pid: 1, // PID 0 is reserved for the kernel
            current_pid: None,
        }
    }
    
    /// Add a new process to the table
    pub fn add_process(&mut self, process: Process) -> ProcessId {
        let pid = process.pid();
        self.processes.push(process);
        pid
    }
    
    /// Allocate a new process ID
    pub const fn allocate_pid(&mut self) -> ProcessId {
        let pid = ProcessId::new(self.next_pid);
        self.next_pid += 1;
        pid
    }
    
    /// Get a process by ID
    #[must_use]
    pub fn get_process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid() == pid)
    }
    
    /// Get a mutable process by ID
    pub fn get_process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.pid() == pid)
    }
    
    /// Get the currently running process
    #[must_use]
    pub fn current_process(&self) -> Option<&Process> {
        self.current_pid.and_then(|pid| self.get_process(pid))
    }
    
    /// Get the currently running process (mutable)
    pub fn current_process_mut(&mut self) -> Option<&mut Process> {
        self.current_pid.and_then(|pid| self.get_process_mut(pid))
    }
    
    /// Set the current process
    pub const fn set_current(&mut self, pid: ProcessId) {
        self.current_pid = Some(pid);
    }
    
    /// Get all ready processes
    pub fn ready_processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter().filter(|p| p.state() == ProcessState::Ready)
    }

    /// Find a terminated child of the given parent
    /// Returns (child_pid, exit_code) if found
    pub fn find_terminated_child(&self, parent_pid: ProcessId) -> Option<(ProcessId, i32)> {
        self.processes.iter()
            .find(|p| p.parent_pid() == Some(parent_pid) && p.state() == ProcessState::Terminated)
            .map(|p| (p.pid(), p.exit_code().unwrap_or(0)))
    }

    /// Check if a process has any children
    pub fn has_children(&self, parent_pid: ProcessId) -> bool {
        self.processes.iter().any(|p| p.parent_pid() == Some(parent_pid))
    }
    
    /// Remove a process from the table (reap)
    pub fn remove_process(&mut self, pid: ProcessId) {
        if let Some(idx) = self.processes.iter().position(|p| p.pid() == pid) {
            self.processes.remove(idx);
        }
    }
}

lazy_static! {
    /// Global process table
    pub static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

/// Memory layout constants
const USER_STACK_SIZE: usize = 64 * 1024; // 64 KiB user stack
const KERNEL_STACK_SIZE: usize = 16 * 1024; // 16 KiB kernel stack per process
#[allow(dead_code)]
const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000; // Top of user stack (below canonical boundary)
#[allow(dead_code)]
const KERNEL_STACK_BASE: u64 = 0xFFFF_8000_0000_0000; // Kernel stacks start here

/// Allocate a user stack for a process
///
/// Allocates `USER_STACK_SIZE` bytes and returns the top address
fn allocate_user_stack() -> VirtAddr {
    let layout = Layout::from_size_align(USER_STACK_SIZE, 16)
        .expect("Invalid stack layout");
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "Failed to allocate user stack");
    // Return the top of the stack (grows downward)
    VirtAddr::new(ptr as u64 + USER_STACK_SIZE as u64)
}

/// Allocate a kernel stack for syscall handling
///
/// Allocates `KERNEL_STACK_SIZE` bytes and returns the top address
fn allocate_kernel_stack() -> VirtAddr {
    let layout = Layout::from_size_align(KERNEL_STACK_SIZE, 16)
        .expect("Invalid stack layout");
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "Failed to allocate kernel stack");
    // Return the top of the stack (grows downward)
    VirtAddr::new(ptr as u64 + KERNEL_STACK_SIZE as u64)
}

/// Create a new user page table
///
/// Creates a minimal page table that maps:
/// - Kernel space (upper half: entries 256-511) copied from current page table
///   This allows kernel code/data to be accessible during syscalls
/// - User space (lower half: entries 0-255) initially empty
///   User code/data will be mapped as needed
///
/// # Phase 2 Implementation
/// - Copies kernel mappings for syscall handling
/// - Isolates user address space per process
/// - Enables per-process memory protection
///
/// # Arguments
/// * `frame_allocator` - Frame allocator for new page tables
/// * `physical_memory_offset` - Offset to access physical memory
///
/// # Returns
/// Physical frame containing the new page table, or error message
fn create_user_page_table<A>(
    frame_allocator: &mut A,
    physical_memory_offset: VirtAddr,
) -> Result<PhysFrame, &'static str>
where
    A: FrameAllocator<Size4KiB>,
{
    // Allocate a frame for the new page table
    let frame = frame_allocator
        .allocate_frame()
        .ok_or("Failed to allocate frame for page table")?;
    
    // Get a mutable reference to the page table
    let page_table_ptr = (physical_memory_offset + frame.start_address().as_u64()).as_mut_ptr::<PageTable>();
    let page_table = unsafe { &mut *page_table_ptr };
    
    // Zero out the page table (clear all entries)
    page_table.zero();
    
    // Copy kernel mappings (upper half: 0xFFFF_8000_0000_0000 and above)
    // This is required for:
    // - Syscall handler code execution
    // - Kernel stack access during syscalls
    // - Interrupt handlers (if interrupts occur in user mode)
    let kernel_pt_frame = x86_64::registers::control::Cr3::read().0;
    let kernel_pt_ptr = (physical_memory_offset + kernel_pt_frame.start_address().as_u64()).as_ptr::<PageTable>();
    let kernel_pt = unsafe { &*kernel_pt_ptr };
    
    // Copy entries 256-511 (kernel space in canonical addressing)
    // Entry 256 maps: 0xFFFF_8000_0000_0000 - 0xFFFF_807F_FFFF_FFFF (512 GiB)
    // Entry 511 maps: 0xFFFF_FF80_0000_0000 - 0xFFFF_FFFF_FFFF_FFFF (512 GiB)
    for i in 256..512 {
        page_table[i] = kernel_pt[i].clone();
    }
    
    Ok(frame)
}

/// Create a new process
///
/// This is a high-level function that allocates a PID and adds the process
/// to the global process table. It also allocates necessary resources like
/// page tables and stacks.
///
/// # Arguments
/// * `entry_point` - Virtual address where execution should start
/// * `frame_allocator` - Frame allocator for page table creation
/// * `physical_memory_offset` - Physical memory offset for page table access
///
/// # Returns
/// Process ID on success, or error message on failure
/// 
/// # Errors
/// Returns error if:
/// - Frame allocation fails for page table
/// - Stack allocation fails (panics, not error)
pub fn create_process<A>(
    entry_point: VirtAddr,
    frame_allocator: &mut A,
    physical_memory_offset: VirtAddr,
) -> Result<ProcessId, &'static str>
where
    A: FrameAllocator<Size4KiB>,
{
    let mut table = PROCESS_TABLE.lock();
    let pid = table.allocate_pid();
    
    // Create user page table
    let page_table_frame = create_user_page_table(frame_allocator, physical_memory_offset)?;
    
    // Allocate stacks
    let kernel_stack = allocate_kernel_stack();
    let user_stack = allocate_user_stack();
    
    // Create process
    let process = Process::new(pid, page_table_frame, kernel_stack, user_stack, entry_point);
    table.add_process(process);
    
    Ok(pid)
}

/// Create a new process and return the Process object
///
/// Similar to `create_process()`, but returns the process directly
/// instead of just the PID. Useful for immediate execution.
///
/// # Arguments
/// * `entry_point` - Virtual address where execution should start
/// * `frame_allocator` - Frame allocator for page table creation  
/// * `physical_memory_offset` - Physical memory offset for page table access
///
/// # Returns
/// Process object on success, or error message on failure
/// 
/// # Errors
/// Returns error if:
/// - Frame allocation fails for page table
/// - Stack allocation fails (panics, not error)
pub fn create_process_with_context<A>(
    entry_point: VirtAddr,
    frame_allocator: &mut A,
    physical_memory_offset: VirtAddr,
) -> Result<Process, &'static str>
where
    A: FrameAllocator<Size4KiB>,
{
    let mut table = PROCESS_TABLE.lock();
    let pid = table.allocate_pid();
    
    // Create user page table
    let page_table_frame = create_user_page_table(frame_allocator, physical_memory_offset)?;
    
    // Allocate stacks (16-byte aligned as verified by syscall.rs)
    let kernel_stack = allocate_kernel_stack();
    let user_stack = allocate_user_stack();
    
    // Verify stack alignment (critical for syscall mechanism)
    debug_assert!(
        kernel_stack.as_u64().is_multiple_of(16),
        "Kernel stack not 16-byte aligned: 0x{:x}",
        kernel_stack.as_u64()
    );
    debug_assert!(
        user_stack.as_u64().is_multiple_of(16),
        "User stack not 16-byte aligned: 0x{:x}",
        user_stack.as_u64()
    );
    
    // Create process
    Ok(Process::new(pid, page_table_frame, kernel_stack, user_stack, entry_point))
}

/// Switch to a process (context switch)
///
/// Updates the kernel stack pointer for syscall handling and switches
/// the page table to the process's address space.
///
/// This should be called before jumping to user mode or when switching
/// between processes.
///
/// # Arguments
/// * `process` - Process to switch to
///
/// # Safety
/// Caller must ensure:
/// - Process has valid page table
/// - Process stacks are properly initialized
/// - No outstanding references to old address space
pub unsafe fn switch_to_process(process: &Process) {
    use x86_64::registers::control::Cr3;
    
    // Update kernel stack for syscall handling
    // This is critical: syscall_entry() will load from CURRENT_KERNEL_STACK
    crate::arch::x86_64::syscall::set_kernel_stack(process.kernel_stack());
    
    // Switch page table (if different from current)
    let (current_frame, flags) = Cr3::read();
    if current_frame != process.page_table_frame() {
        unsafe {
            Cr3::write(process.page_table_frame(), flags);
        }
    }
}

/// Jump to user mode with the given process context
///
/// This function:
/// 1. Switches to the process's address space
/// 2. Sets up the kernel stack for syscall handling  
/// 3. Transitions to Ring 3 and begins execution
///
/// # Safety
/// This function is unsafe because:
/// - It directly manipulates CPU registers and privilege levels
/// - The process must have valid executable code at entry point
/// - The process must have valid stacks
/// - Interrupts must be properly configured
///
/// # Arguments
/// * `process` - Process to execute
#[allow(dead_code)]
pub unsafe fn jump_to_usermode_with_process(process: &Process) -> ! {
    // Switch to process context (page table + kernel stack)
    unsafe {
        switch_to_process(process);
    }
    
    // Mark as current process
    PROCESS_TABLE.lock().set_current(process.pid());
    
    // Jump to user mode
    let entry = VirtAddr::new(process.registers().rip);
    unsafe {
        jump_to_usermode(entry, process.user_stack())
    }
}



/// Schedule the next process and switch to it
///
/// This function:
/// 1. Picks the next process using the scheduler
/// 2. Releases the process table lock (critical for avoiding deadlocks)
/// 3. Performs the context switch
///
/// If no other process is ready, it returns immediately (if current is ready)
/// or loops/halts (if current is blocked).
pub fn schedule_next() {
    use crate::kernel::scheduler::SCHEDULER;
    
    // 1. Pick next process and prepare for switch
    let switch_info = {
        let mut table = PROCESS_TABLE.lock();
        let mut scheduler = SCHEDULER.lock();
        
        let current_pid = table.current_pid;
        
        // If current process is running, it should be in Ready state (unless it blocked itself)
        // The scheduler will pick it up if it's Ready.
        
        if let Some(next_pid) = scheduler.schedule() {
            if Some(next_pid) == current_pid {
                // Same process, no switch needed
                None
            } else {
                // Switch needed
                let current = table.current_process_mut().expect("Current process invalid");
                let current_ctx_ptr = current.context_rsp_mut() as *mut u64;
                
                let next = table.get_process(next_pid).expect("Next process invalid");
                let next_ctx_val = next.context_rsp();
                
                // Update current PID
                table.set_current(next_pid);
                
                Some((current_ctx_ptr, next_ctx_val))
            }
        } else {
            // No ready processes.
            // If current is blocked, we have a problem (deadlock/idle).
            // For now, we assume there's always an idle process or we just return.
            // But if we return and we are Blocked, we will just loop in sys_wait?
            // Ideally we should enable interrupts and halt.
            None
        }
    }; // Locks released
    
    // 2. Perform switch if needed
    if let Some((current_ctx_ptr, next_ctx_val)) = switch_info {
        unsafe {
            crate::kernel::process::switch::switch_context_asm(current_ctx_ptr, next_ctx_val);
        }
    }
}

/// Switch to user mode and jump to the specified entry point
///
/// This is a low-level function that performs the actual Ring 0 -> Ring 3
/// transition. For most use cases, use `jump_to_usermode_with_process()` instead.
///
/// # Safety
/// This function is unsafe because:
/// - It directly manipulates CPU registers and privilege levels
/// - The `entry_point` must point to valid executable code
/// - The `user_stack` must point to a valid, writable memory region
/// - Interrupts must be properly configured before calling
/// - Caller must ensure kernel stack is set via `switch_to_process()` or `set_kernel_stack()`
///
/// # Arguments
/// * `entry_point` - Virtual address of user code to execute
/// * `user_stack` - Virtual address of the top of user stack
#[allow(dead_code)]
pub unsafe fn jump_to_usermode(entry_point: VirtAddr, user_stack: VirtAddr) -> ! {
    use x86_64::registers::rflags::RFlags;
    
    // GDT selector values (must match your GDT setup)
    // Typically: USER_DATA_SELECTOR = 0x20 | 3, USER_CODE_SELECTOR = 0x18 | 3
    const USER_DATA_SELECTOR: u64 = 0x23; // Ring 3 data segment (0x20 | 3)
    const USER_CODE_SELECTOR: u64 = 0x1B; // Ring 3 code segment (0x18 | 3)
    
    // Prepare RFLAGS: enable interrupts (IF=1)
    let rflags = (RFlags::INTERRUPT_FLAG).bits();
    
    // Use sysretq instruction to return to user mode
    // Stack layout for iretq:
    // [SS, RSP, RFLAGS, CS, RIP]
    unsafe {
        core::arch::asm!(
            "cli",                    // Disable interrupts during transition
            "mov ds, {0:x}",          // Set data segments
            "mov es, {0:x}",
            "mov fs, {0:x}",
            "mov gs, {0:x}",
            
            // Push iretq frame
            "push {0}",               // SS (stack segment)
            "push {1}",               // RSP (user stack pointer)
            "push {2}",               // RFLAGS
            "push {3}",               // CS (code segment)
            "push {4}",               // RIP (entry point)
            
            "iretq",                  // Return to user mode
            
            in(reg) USER_DATA_SELECTOR,
            in(reg) user_stack.as_u64(),
            in(reg) rflags,
            in(reg) USER_CODE_SELECTOR,
            in(reg) entry_point.as_u64(),
            options(noreturn)
        )
    }
}

/// Get the current process ID
#[must_use]
pub fn current_pid() -> Option<ProcessId> {
    PROCESS_TABLE.lock().current_pid
}

/// `useContext(pid)`: temporarily switch the active page table to `pid`'s
/// without otherwise touching scheduler state - the current thread keeps
/// running, and `PROCESS_TABLE`'s notion of "current process" is
/// unchanged. For handlers that need to manipulate another process's
/// address space in place (§4.6's framebuffer-mapping pattern). Returns
/// the frame that was active before the switch, to be restored by
/// `release_context()`.
pub fn use_context(pid: ProcessId) -> Option<PhysFrame> {
    use x86_64::registers::control::Cr3;
    let target_frame = PROCESS_TABLE.lock().get_process(pid)?.page_table_frame();
    let (previous_frame, flags) = Cr3::read();
    if previous_frame != target_frame {
        unsafe {
            Cr3::write(target_frame, flags);
        }
    }
    Some(previous_frame)
}

/// `releaseContext(previous)`: restore the page table that was active
/// before the matching `use_context()` call.
pub fn release_context(previous: PhysFrame) {
    use x86_64::registers::control::Cr3;
    let (current, flags) = Cr3::read();
    if current != previous {
        unsafe {
            Cr3::write(previous, flags);
        }
    }
}
