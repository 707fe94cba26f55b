//! File management inside a server's running container.
//!
//! All access goes through the runtime's exec and archive-copy calls; nothing
//! here touches the host filesystem.

pub mod archive;
pub mod listing;
pub mod manager;
pub mod path;
pub mod safety;
pub mod stream;
pub mod types;

pub use types::{Download, ExtractReport, FileInfo, FileManager, FilePolicy, FileType};
