//! Wire types of the source HTTP API.

pub mod v1;
