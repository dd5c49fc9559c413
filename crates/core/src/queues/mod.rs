pub mod bounded_fifo;

pub use bounded_fifo::*;
