use serde::Serialize;

/// 打包下载的字节进度
///
/// 目录大小事先未知：列举过程中累加 `total_size`，全部列举完成后
/// 才标记 `size_is_final`，在此之前不给出进度比例。
/// 大小未知的文件在读完流之前同样不给出进度比例。
#[derive(Debug, Default)]
pub struct ArchiveProgress {
    total_size: u64,
    size_is_final: bool,
    files: Vec<FileProgress>,
    /// 大小尚未确定的文件数
    unknown_files: usize,
    downloaded: u64,
}

#[derive(Debug, Clone, Copy)]
struct FileProgress {
    size: Option<u64>,
    done: u64,
}

/// 进度快照（回调参数）
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total: u64,
    pub fraction: f64,
}

impl ArchiveProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个新发现的文件，返回文件序号
    pub fn register_file(&mut self, size: Option<u64>) -> usize {
        match size {
            Some(size) => self.total_size += size,
            None => self.unknown_files += 1,
        }
        self.files.push(FileProgress { size, done: 0 });
        self.files.len() - 1
    }

    /// 文件累计收到 `bytes` 字节（超出已知文件大小的部分不计）
    pub fn add_bytes(&mut self, index: usize, bytes: u64) {
        if let Some(file) = self.files.get_mut(index) {
            let next = match file.size {
                Some(size) => (file.done + bytes).min(size),
                None => file.done + bytes,
            };
            self.downloaded += next - file.done;
            file.done = next;
        }
    }

    /// 文件直接记为完成（缓存命中或流读完）
    ///
    /// 大小未知的文件以实际收到的字节数作为大小。
    pub fn complete_file(&mut self, index: usize) {
        let Some(file) = self.files.get(index).copied() else {
            return;
        };
        match file.size {
            Some(size) => self.add_bytes(index, size - file.done),
            None => {
                self.files[index].size = Some(file.done);
                self.total_size += file.done;
                self.unknown_files -= 1;
            }
        }
    }

    /// 标记列举完成
    pub fn finalize_size(&mut self) {
        self.size_is_final = true;
    }

    pub fn size_is_final(&self) -> bool {
        self.size_is_final
    }

    pub fn unknown_files(&self) -> usize {
        self.unknown_files
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// 进度快照，总大小未确定时为 None
    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        if !self.size_is_final || self.unknown_files > 0 {
            return None;
        }
        let fraction = if self.total_size == 0 {
            1.0
        } else {
            self.downloaded as f64 / self.total_size as f64
        };
        Some(ProgressSnapshot {
            downloaded: self.downloaded,
            total: self.total_size,
            fraction,
        })
    }
}
