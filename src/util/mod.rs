pub(crate) mod lock;
pub mod pool;
