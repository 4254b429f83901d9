//! # Quasar
//!
//! Quasar is a concurrent reference-counting garbage collection library for
//! VMs implemented in Rust. Mutator threads never touch reference counts:
//! every managed pointer write goes through a [`Slot`], which pushes
//! increment/decrement tokens into thread-local queues. A dedicated collector
//! thread drains the queues once per epoch through a lightweight
//! signal-delivered handshake, applies the counts, and resolves cyclic
//! garbage with a synchronous tri-color cycle detector. A finalizer thread
//! runs user cleanup on condemned objects that requested it.
//!
//! # Features
//! - Segregated size-class heap over anonymous mappings, with lock-free chunk
//!   recycling and a block registry for conservative pointer queries
//! - Deferred reference counting: mutators only enqueue tokens, the collector
//!   owns the counts
//! - Synchronous cycle detection over purple roots, with an object-revival
//!   protocol that keeps weak-handle upgrades sound during collection
//! - Weak, final, and dependent handles
//!
//! Threads that allocate or write slots must be attached with
//! [`Engine::attach`]; the returned [`Mutator`] guard detaches on drop.

pub mod collector;
pub mod engine;
pub mod handles;
pub mod heap;
pub mod mmap;
pub mod object;
pub mod queue;
pub mod slot;
pub mod thread;

#[cfg(test)]
mod tests;

pub use engine::{Engine, Mutator, Options, Statistics};
pub use handles::{DependentHandle, NormalHandle, WeakHandle};
pub use heap::HeapStatistics;
pub use object::{Color, Object, Type};
pub use slot::{Local, Slot};
