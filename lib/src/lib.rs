#![no_std]

pub mod alignment;
pub mod klog;
pub mod spinlock;
pub mod testing;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down_u64, align_down_usize, align_up_u64, align_up_usize};
pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use spinlock::{IrqMutex, IrqMutexGuard};
