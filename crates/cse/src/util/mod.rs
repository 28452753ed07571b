pub mod dict;
pub mod keyed_lock;
