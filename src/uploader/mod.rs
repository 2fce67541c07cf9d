// 上传引擎模块
//
// - 队列协调器：优先级排队、事件驱动晋升、暂停/恢复/取消
// - 分片调度器：按当前分片大小切分，有界并发上传，完成后合并
// - 任务级重试预算：初始化、分片、合并共享同一份重试次数

pub mod chunk;
mod context;
pub mod coordinator;
pub mod payload;
pub mod retry;
mod scheduler;
pub mod task;

pub use chunk::{estimate_chunk_count, ChunkPlanner, CompletedChunk, UploadChunk};
pub use coordinator::{CoordinatorBuilder, QueueCoordinator, QueueStatus, SubmitRequest};
pub use payload::{FilePayload, MemoryPayload, Payload, PayloadHandle};
pub use retry::{should_retry, RetryBudget, RetryPolicy};
pub use task::{
    ProgressUpdate, QueuedTask, SessionContext, TaskCallbacks, TaskSnapshot, UploadStatus,
    UploadTask,
};
