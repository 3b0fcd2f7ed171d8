pub mod backoff;
pub mod random;
pub mod result_cell;
