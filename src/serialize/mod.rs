pub mod serde_addr;
