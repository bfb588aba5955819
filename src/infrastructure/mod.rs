pub mod in_memory;

#[cfg(feature = "bus-kafka")]
pub mod kafka;

#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
