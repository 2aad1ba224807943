//! Circular - Lock-Free Ring Buffer
//!
//! A fixed-capacity, power-of-two circular buffer for passing handles
//! between threads without a lock.
//!
//! - Lock-Free: producers and consumers claim positions by compare-and-swap
//! - Multi-producer, multi-consumer, FIFO by reservation order
//! - Lossless: a full ring makes producers wait (or hands the value back)
//!
//! ```
//! use circular::RingBuffer;
//!
//! let rb = RingBuffer::new(8).unwrap();
//! rb.publish("a");
//! rb.publish("b");
//!
//! assert_eq!(rb.consume(), "a");
//! assert_eq!(rb.consume(), "b");
//! assert!(rb.is_empty());
//! ```

pub mod config;
pub mod core;
mod error;

pub use crate::core::RingBuffer;
pub use error::Error;
