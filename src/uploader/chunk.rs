// 上传分片管理
//
// 分片不预先切好，而是每次调度时按当前分片大小从剩余字节中切出下一个：
// - 已经创建的分片范围不再改变
// - 分片大小调整只影响之后创建的分片
// - 分片总数随分片大小变化重新估算，剩余字节切完后才最终确定

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 已完成分片的回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedChunk {
    pub index: usize,
    /// 服务端返回的校验值（ETag）
    pub checksum: String,
    pub size: u64,
}

/// 分片规划器
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    total_size: u64,
    next_offset: u64,
    next_index: usize,
}

impl ChunkPlanner {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            next_offset: 0,
            next_index: 0,
        }
    }

    /// 按给定分片大小切出下一个分片
    pub fn next_chunk(&mut self, chunk_size: u64) -> Option<UploadChunk> {
        if !self.has_remaining() {
            return None;
        }
        let chunk_size = chunk_size.max(1);
        let start = self.next_offset;
        let end = start.saturating_add(chunk_size).min(self.total_size);

        let chunk = UploadChunk::new(self.next_index, start..end);
        self.next_offset = end;
        self.next_index += 1;
        Some(chunk)
    }

    pub fn has_remaining(&self) -> bool {
        self.next_offset < self.total_size
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_size - self.next_offset
    }

    /// 已创建的分片数
    pub fn planned_count(&self) -> usize {
        self.next_index
    }

    /// 按当前分片大小估算的分片总数
    pub fn estimated_total_chunks(&self, chunk_size: u64) -> usize {
        self.next_index + estimate_chunk_count(self.remaining_bytes(), chunk_size)
    }
}

/// 计算给定大小需要的分片数
pub fn estimate_chunk_count(total_size: u64, chunk_size: u64) -> usize {
    total_size.div_ceil(chunk_size.max(1)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_creation() {
        let chunk = UploadChunk::new(0, 0..4 * MB);
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.size(), 4 * MB);
    }

    #[test]
    fn test_chunk_calculation() {
        // 16MB 文件，4MB 分片
        let mut planner = ChunkPlanner::new(16 * MB);
        assert_eq!(planner.estimated_total_chunks(4 * MB), 4);
        let mut chunks = Vec::new();
        while let Some(chunk) = planner.next_chunk(4 * MB) {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 4);

        // 17MB 文件，最后一个分片 1MB
        let mut planner = ChunkPlanner::new(17 * MB);
        let mut last = None;
        while let Some(chunk) = planner.next_chunk(4 * MB) {
            last = Some(chunk);
        }
        let last = last.unwrap();
        assert_eq!(last.index, 4);
        assert_eq!(last.size(), MB);
        assert_eq!(planner.planned_count(), 5);
    }

    #[test]
    fn test_resize_affects_only_new_chunks() {
        let mut planner = ChunkPlanner::new(10 * MB);
        let first = planner.next_chunk(4 * MB).unwrap();
        assert_eq!(first.range, 0..4 * MB);
        assert_eq!(planner.estimated_total_chunks(4 * MB), 3);

        // 网络变差，分片缩小到 1MB
        assert_eq!(planner.estimated_total_chunks(MB), 7);
        let second = planner.next_chunk(MB).unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.range, 4 * MB..5 * MB);
        assert_eq!(planner.remaining_bytes(), 5 * MB);
    }

    #[test]
    fn test_chunks_tile_payload() {
        let sizes = [3 * MB, MB / 2, 7 * MB, 1, 2 * MB];
        let total = 9 * MB + 12345;
        let mut planner = ChunkPlanner::new(total);
        let mut expected_start = 0;
        let mut i = 0;
        while let Some(chunk) = planner.next_chunk(sizes[i % sizes.len()]) {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.range.start, expected_start);
            expected_start = chunk.range.end;
            i += 1;
        }
        assert_eq!(expected_start, total);
        assert_eq!(planner.estimated_total_chunks(MB), planner.planned_count());
    }

    #[test]
    fn test_estimate_chunk_count() {
        assert_eq!(estimate_chunk_count(0, 4 * MB), 0);
        assert_eq!(estimate_chunk_count(1, 4 * MB), 1);
        assert_eq!(estimate_chunk_count(4 * MB, 4 * MB), 1);
        assert_eq!(estimate_chunk_count(4 * MB + 1, 4 * MB), 2);
        // 分片大小为 0 时按 1 字节处理
        assert_eq!(estimate_chunk_count(3, 0), 3);
    }
}
