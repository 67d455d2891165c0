mod scripts;
pub mod storage;

pub use storage::RedisBackend;
