//! Data models for the gateway

mod entity;
mod sample;
mod value;

pub use entity::*;
pub use sample::*;
pub use value::*;
