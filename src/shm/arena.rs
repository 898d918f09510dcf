//! 驱动共享内存区域（arena）视图
//!
//! 设计目标：
//! - 非拥有：内存由内核驱动分配和回收，客户端只借用一个映射
//! - 零锁：驱动随时可能并发写入，绝不通过 &[u8] 暴露共享内存
//! - 两段式环绕寻址：把端点子区域内的一段逻辑连续字节解析为
//!   (first, second) 两个物理片段，mux/demux 共用这一原语
//!
//! 映射只在会话打开期间有效，由 session 层的互斥锁保证失效后不再访问

use std::ptr::NonNull;

/// 共享 arena 内的一个物理片段（绝对偏移 + 长度）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

/// 两段式片段对
///
/// 逻辑连续的一段字节在环形子区域内最多跨越一次边界：
/// first 从当前位置到区域尾部，second 从区域头部继续
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanPair {
    pub first: Span,
    pub second: Span,
}

impl SpanPair {
    /// 两段的总字节数
    #[inline]
    pub fn total_len(&self) -> usize {
        self.first.len + self.second.len
    }
}

/// 端点在共享 arena 内的环形子区域 `[offset, offset + size)`
#[derive(Clone, Copy, Debug)]
pub struct RingWindow {
    pub offset: usize,
    pub size: usize,
}

impl RingWindow {
    pub fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// 把从 `position` 开始、长度 `len` 的逻辑连续字节解析为片段对
    ///
    /// `first = [offset+position, offset+position+min(len, size-position))`
    /// `second = [offset, offset + (len - first.len))`
    ///
    /// 调用方保证 `position <= size`（无效端点在快照校验阶段已被过滤）
    #[inline]
    pub fn span_pair(&self, position: usize, len: usize) -> SpanPair {
        debug_assert!(position <= self.size);

        let first_len = len.min(self.size - position);

        SpanPair {
            first: Span {
                offset: self.offset + position,
                len: first_len,
            },
            second: Span {
                offset: self.offset,
                len: len - first_len,
            },
        }
    }
}

/// 驱动映射的共享字节区域的非拥有视图
///
/// 驱动随时并发读写这块内存，所以这里只提供按偏移的原始字节拷贝，
/// 永远不构造指向共享内存的切片引用
pub struct ArenaView {
    base: NonNull<u8>,
    len: usize,
}

// 裸指针默认 !Send/!Sync。视图本身不做任何同步，
// 跨线程访问由 session 层的互斥锁串行化
unsafe impl Send for ArenaView {}
unsafe impl Sync for ArenaView {}

impl ArenaView {
    /// 包装驱动返回的映射
    ///
    /// # Safety
    ///
    /// `base..base+len` 必须是有效的可读写映射，且在视图被丢弃前保持有效。
    /// session 层在控制通道关闭前丢弃视图来维持这一点。
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// 映射的总字节数
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 从 arena 拷出 `out.len()` 字节
    ///
    /// 驱动可能在拷贝过程中写入同一区域，撕裂由上层的
    /// generation 快照比较检测，这里只保证不越界
    #[inline]
    pub(crate) fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// 向 arena 拷入 `src.len()` 字节
    #[inline]
    pub(crate) fn write_bytes(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
        }
    }

    /// 指定偏移处的裸指针（寄存器表等内嵌结构用）
    #[inline]
    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        unsafe { self.base.as_ptr().add(offset) }
    }
}
