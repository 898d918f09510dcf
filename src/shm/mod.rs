//! 共享内存核心模块
//!
//! 包含：
//! - Arena: 驱动映射的共享字节区域视图和两段式环绕寻址
//! - Registers: 驱动拥有的端点寄存器表（volatile 快照/比较）
//! - Convert: 交织/解交织样本搬运（mux/demux）
//!
//! 这些都是叶子原语：不持有任何锁，不做任何分配

pub mod arena;
pub mod convert;
pub mod registers;

pub use arena::{ArenaView, RingWindow, Span, SpanPair};
pub use registers::{
    generation_is_active, generation_number, EndpointRegisters, RegisterSnapshot, RegisterTable,
};
