//! Core module: eksekusi task yang terurut
//!
//! Prinsip desain:
//! - Serial per owner: satu `Strand` tidak pernah menjalankan dua task sekaligus
//! - Settle-once: setiap task punya tepat satu hasil di `Future`-nya
//! - Tidak ada callback user yang berjalan sambil memegang lock internal

mod executor;
mod future;
mod strand;

pub use executor::{ExecutionContext, Job, ThreadPool};
pub use future::{Cancellation, Future, Promise};
pub use strand::{CancelOption, ExecutionOptions, Strand};
