#![allow(dead_code)]

pub mod builders;
pub mod fake_transport;

pub use builders::*;
pub use fake_transport::*;
