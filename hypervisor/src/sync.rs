//! Thin re-export of the lock primitives the core is specified to consume
//! as an external collaborator ("(d) a simple lock primitive", §1).
//!
//! The teacher crate already reaches for `spin` directly at each call site;
//! this module exists only so every MAM/GPM/accountant lock is named
//! consistently and so the collaborator boundary is visible at a glance.

pub(crate) use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
