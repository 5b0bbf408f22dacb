pub mod audit;
pub mod candidate;
pub mod citation;
pub mod composite;
pub mod filter;
pub mod fusion;
pub mod phase;
pub mod plan;
pub mod question;
pub mod study;
pub mod timestamp;

mod error;

pub use error::{Error, Result};
