//! Threads, memory and synchronization for the gravel runtime.
//!
//! This crate is the machine-facing layer: a fixed pool of pinned worker
//! threads ([`thread_pool`]), per-thread and per-socket storage with
//! program-lifetime-stable slot addresses ([`per_thread`]), a NUMA-aware
//! page pool and the block heaps built on it ([`page_pool`], [`heaps`]),
//! and the synchronization primitives parallel loops are built from
//! ([`barrier`], [`termination`], [`sync`]).
//!
//! Layering is strictly leaves-first: topology has no dependencies, the
//! pool depends on topology and the latches, storage depends on the pool's
//! thread ids and the page pool, and the barriers and termination detectors
//! are expressed in terms of storage. The executor crate sits on top and
//! should not need anything from the OS that isn't already wrapped here.
//!
//! Unsafe code lives in the thread pool (scoped task lifetimes) and the
//! storage/heap layer (raw arena and block carving); everything above uses
//! the safe interfaces.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod barrier;
pub mod heaps;
pub mod page_pool;
pub mod per_thread;
pub mod sync;
pub mod termination;
pub mod thread_pool;
pub mod topology;
