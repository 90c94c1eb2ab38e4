//! The Ferry Library.
//!
//! Vocabulary shared between the system being migrated from (the source)
//! and the system pulling the data (the destination).

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod api;
pub mod error;
pub mod relation;
pub mod state;
pub mod status;

pub use error::{FerryError, FerryResult};
