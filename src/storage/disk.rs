//! Disk access: single paged files and the file allocation layer above them.

pub mod file_manager;
pub mod page_manager;

pub use file_manager::FileManager;
pub use page_manager::PageManager;
