pub mod domain;
pub mod error;
pub mod graph;
pub mod protocol;
