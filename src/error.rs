//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for this crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not present in this `Context`")]
    BadNode,

    #[error("`Context` is empty")]
    EmptyContext,
}
