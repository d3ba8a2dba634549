//! Mining ASIC drivers.

pub mod bm1380;
