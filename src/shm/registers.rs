//! 端点寄存器表
//!
//! 寄存器由内核驱动拥有，内嵌在共享 arena 中，每个端点一份。
//! 驱动随时可能重新配置端点（generation 变化），客户端这边采用
//! 乐观并发：拷贝前取一次快照，拷贝后重读 generation 比较。
//! 两次 generation 的 tag 相等当且仅当期间没有发生重配置。
//!
//! 访问全部走 volatile，绝不把寄存器表当成普通引用别名

use std::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile, NonNull};

use super::arena::ArenaView;

/// generation 的 active 标志位（bit 31）
///
/// 低 31 位是单调递增的 tag，驱动每次重配置端点时 +1；
/// active 位独立反映端点当前是否有存活的音频客户端
pub const GENERATION_ACTIVE_FLAG: u32 = 1 << 31;

/// 取 generation 的 tag 部分
#[inline]
pub fn generation_number(generation: u32) -> u32 {
    generation & !GENERATION_ACTIVE_FLAG
}

/// generation 的 active 位是否置位
#[inline]
pub fn generation_is_active(generation: u32) -> bool {
    generation & GENERATION_ACTIVE_FLAG != 0
}

/// 单个端点的寄存器布局（与驱动共享的 ABI，字段均为小端 u32）
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointRegisters {
    /// 重配置 tag + active 标志位
    pub generation: u32,
    /// 驱动侧当前的活动声道数
    pub active_channel_count: u32,
    /// 端点环形子区域在 arena 内的起始偏移
    pub buffer_offset: u32,
    /// 端点环形子区域的字节数
    pub buffer_size: u32,
    /// 每圈唤醒点数量：0 = 从不，1 = 仅回绕处，2 = 回绕处和中点
    pub notification_count: u32,
    /// 子区域内的当前读写偏移
    pub position_register: u32,
}

/// 某一时刻读到的一份端点寄存器
///
/// 显式值类型：拷贝期间驱动改写寄存器不会影响已经取走的快照，
/// 撕裂检测靠之后重读 generation 比较完成
#[derive(Clone, Copy, Debug)]
pub struct RegisterSnapshot {
    pub generation: u32,
    pub active_channel_count: u32,
    pub buffer_offset: u32,
    pub buffer_size: u32,
    pub notification_count: u32,
    pub position_register: u32,
}

impl RegisterSnapshot {
    /// 本周期内端点是否可用
    ///
    /// 不可用的情形：active 位未置、子区域为空、位置越过区域尾部、
    /// 子区域超出 arena。任何一条满足都意味着本周期输出静音并跳过
    pub fn is_valid(&self, arena_size: usize) -> bool {
        generation_is_active(self.generation)
            && self.buffer_size != 0
            && self.position_register <= self.buffer_size
            && self.buffer_offset as u64 + self.buffer_size as u64 <= arena_size as u64
    }
}

/// 驱动拥有的寄存器表的非拥有视图
pub struct RegisterTable {
    base: NonNull<EndpointRegisters>,
    count: usize,
}

// 与 ArenaView 相同：跨线程访问由 session 层互斥锁串行化
unsafe impl Send for RegisterTable {}
unsafe impl Sync for RegisterTable {}

impl RegisterTable {
    /// 在 arena 内的 `offset` 处构造 `count` 项寄存器表视图
    ///
    /// # Safety
    ///
    /// `offset` 必须按 `EndpointRegisters` 对齐，且
    /// `offset + count * size_of::<EndpointRegisters>() <= arena.len()`。
    /// 视图的有效期与 arena 映射一致。
    pub unsafe fn new(arena: &ArenaView, offset: usize, count: usize) -> Self {
        let base = arena.ptr_at(offset) as *mut EndpointRegisters;
        debug_assert!(base as usize % std::mem::align_of::<EndpointRegisters>() == 0);

        Self {
            base: NonNull::new_unchecked(base),
            count,
        }
    }

    /// 表中的端点数
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    fn reg_ptr(&self, index: usize) -> *mut EndpointRegisters {
        debug_assert!(index < self.count);
        unsafe { self.base.as_ptr().add(index) }
    }

    /// 取端点 `index` 的一份快照（逐字段 volatile 读）
    pub fn snapshot(&self, index: usize) -> RegisterSnapshot {
        let p = self.reg_ptr(index);

        unsafe {
            RegisterSnapshot {
                generation: read_volatile(addr_of!((*p).generation)),
                active_channel_count: read_volatile(addr_of!((*p).active_channel_count)),
                buffer_offset: read_volatile(addr_of!((*p).buffer_offset)),
                buffer_size: read_volatile(addr_of!((*p).buffer_size)),
                notification_count: read_volatile(addr_of!((*p).notification_count)),
                position_register: read_volatile(addr_of!((*p).position_register)),
            }
        }
    }

    /// 单独重读 generation（拷贝后的二次校验）
    #[inline]
    pub fn generation(&self, index: usize) -> u32 {
        let p = self.reg_ptr(index);
        unsafe { read_volatile(addr_of!((*p).generation)) }
    }

    /// 推进位置寄存器
    ///
    /// 只有在两次 generation 比较一致后才允许写入
    #[inline]
    pub fn set_position(&self, index: usize, position: u32) {
        let p = self.reg_ptr(index);
        unsafe { write_volatile(addr_of_mut!((*p).position_register), position) }
    }
}
