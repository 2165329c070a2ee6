pub mod keys;
pub mod probe;
