//! Errors returned by both allocators (spec §4.2, §4.3).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("not enough free CPUs: requested {requested}, only {available} free")]
    NotEnoughFreeCpus { requested: usize, available: usize },

    #[error("not enough held CPUs to release: requested {requested}, only {available} held")]
    NotEnoughHeldCpus { requested: usize, available: usize },
}
