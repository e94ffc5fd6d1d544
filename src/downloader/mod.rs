pub mod archive;
pub mod item;
pub mod progress;

pub use archive::{ArchiveOptions, ArchiveTarget, OnArchiveProgress, StreamingArchiveDownloader};
pub use item::{DownloadSource, TransferItem};
pub use progress::{ArchiveProgress, ProgressSnapshot};
