//! Shared primitives for the cache proxy: hashing, signing, and async
//! stream helpers used on both the pipeline and the storage sides.

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

pub mod chunking;
pub mod error;
pub mod hash;
pub mod signing;
pub mod stream;
pub mod util;

pub use error::{AtticError, AtticResult};
