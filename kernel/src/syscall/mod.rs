//! System calls: trap entry, classification, the global queue, and the
//! handler modules.

pub mod dispatcher;
pub mod errno;
pub mod fs_calls;
pub mod ipc_calls;
pub mod numbers;
pub mod proc_calls;
pub mod queue;
pub mod request;
#[cfg(feature = "selftest")]
pub mod test;

pub use dispatcher::{dispatch_slot, syscall_handle};
pub use errno::Errno;
pub use queue::{syscall_enqueue, syscall_process};
pub use request::{SyscallHandler, SyscallRequest};
