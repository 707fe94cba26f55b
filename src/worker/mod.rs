pub mod api;
pub mod types;
#[allow(clippy::module_inception)]
pub mod worker;

pub use api::ApiServer;
pub use types::{Dispatcher, DispatcherConfig};
