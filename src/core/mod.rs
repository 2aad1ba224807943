//! Core module: lock-free ring buffer
//!
//! Design principles:
//! - Lock-Free: cursors move by compare-and-swap only, no Mutex/RwLock
//! - No-Allocation: all slots are allocated once at construction
//! - Lossless: a full ring pushes back on producers instead of overwriting

mod ring_buffer;

pub use ring_buffer::RingBuffer;
