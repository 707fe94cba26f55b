pub mod allocator;
pub mod types;

pub use types::{PortAllocator, PortMapping, PortRange, Protocol};
