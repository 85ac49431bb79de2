//! Verified pure functions for branch-trace collection.
//!
//! This module contains pure, deterministic functions extracted from the
//! effectful ring-buffer, session and CPU code for formal verification with
//! [Verus](https://github.com/verus-lang/verus).  Each sub-module covers one
//! domain and contains only functions with **no I/O, no system calls, and no
//! external state mutation**.
//!
//! Every piece of wraparound arithmetic the collector performs on the
//! kernel ring buffer lives in [`ring`].  Callers never compute offsets into
//! the mapped region themselves.
//!
//! # Corresponding Verus specs
//!
//! Formal specifications live in `verus/ring_spec.rs` and
//! `verus/cpu_spec.rs`.  They are not compiled by `cargo`; they are consumed
//! by the Verus verifier separately.

pub mod cpu;
pub mod ring;
