// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Common utilities shared by the timberline crates.

pub mod config;
pub mod retry;
pub mod time;

/// Define the `Result` alias for the `Error` type of the enclosing module.
#[macro_export]
macro_rules! define_result {
    ($t:ty) => {
        pub type Result<T> = std::result::Result<T, $t>;
    };
}
