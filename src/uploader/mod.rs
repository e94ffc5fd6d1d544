pub mod folder;
pub mod pool;
pub mod tree;

pub use folder::{ConcurrentFolderUploader, OnUploadSuccess, UploadOptions};
pub use pool::AdaptiveConcurrency;
pub use tree::{BreadthFirst, FolderNode, FolderTreeWalker, ScanOptions, TreeStats};
