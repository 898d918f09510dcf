//! 会话与周期引擎
//!
//! 核心设计：每个音频周期在实时线程上执行一次 tick，对每个端点做
//! 快照 → 搬运 → 二次校验 → 推进/唤醒。与驱动之间没有任何锁——
//! 驱动随时可能重配置端点，撕裂靠 generation 快照比较检测（乐观并发）。
//!
//! 整个核心只有一把互斥锁：保护"会话是否打开"和 arena/寄存器表指针，
//! tick 与 stop 之间靠它互斥。会话关闭后 tick 是纯空操作。
//!
//! start/stop 是仅有的阻塞调用，只允许在控制线程使用

pub mod notify;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_utils::CachePadded;

use crate::driver::{
    BufferLayoutRequest, ControlChannel, ControlError, CreateEndpointRequest, EndpointKind,
    WakeHandle,
};
use crate::shm::arena::RingWindow;
use crate::shm::convert::{demux, mux};
use crate::shm::registers::{generation_is_active, generation_number, EndpointRegisters};
use crate::shm::{ArenaView, RegisterTable};
use notify::NotificationHandleCache;

/// 单个端点的静态配置（会话存续期间不变）
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub kind: EndpointKind,
    pub channel_count: u32,
    /// 展示名
    pub name: String,
    /// 稳定标识
    pub id: String,
}

/// 共享缓冲区布局参数
///
/// 约束（未作运行时检查，沿用驱动协议的前提）：
/// `period_frames × sample_size × 端点声道数` 不得超过端点环形
/// 子区域的一半，否则一个周期内可能完全跳过一次唤醒点
#[derive(Clone, Copy, Debug)]
pub struct BufferParams {
    /// 每周期的帧数
    pub period_frames: u32,
    pub sample_rate: u32,
    /// 单个样本的字节数
    pub sample_size: u32,
    /// 期望的 arena 总字节数
    pub arena_size: u32,
}

impl Default for BufferParams {
    fn default() -> Self {
        Self {
            period_frames: 512,
            sample_rate: 48000,
            sample_size: 4,
            // 16 MiB，后续可以按端点配置推导
            arena_size: 16 * 1024 * 1024,
        }
    }
}

impl BufferParams {
    /// 每声道每周期的字节数（= 外部目标缓冲区的长度）
    #[inline]
    pub fn period_bytes_per_channel(&self) -> usize {
        self.period_frames as usize * self.sample_size as usize
    }
}

/// 会话配置
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub buffer: BufferParams,
    /// 启用应用路由过滤器（失败只记日志，不影响启动）
    pub enable_routing_filter: bool,
    /// WaveRT 最小帧数（>= 2 时才随布局请求下发）
    pub min_frame_count: Option<u32>,
}

/// 会话错误
#[derive(Debug)]
pub enum SessionError {
    Control(ControlError),
    AlreadyOpen,
    BadLayout(&'static str),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control(e) => write!(f, "Control channel error: {}", e),
            Self::AlreadyOpen => write!(f, "Session is already open"),
            Self::BadLayout(s) => write!(f, "Bad buffer layout: {}", s),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ControlError> for SessionError {
    fn from(e: ControlError) -> Self {
        Self::Control(e)
    }
}

/// 单个端点本周期的目标缓冲区：每声道一个，None 表示该声道缺席
pub struct EndpointTargets<'a> {
    pub channels: &'a mut [Option<&'a mut [u8]>],
}

/// 双缓冲目标集
///
/// 两组交替的每端点/每声道缓冲区，tick 以 buffer_index 选择其一。
/// 缓冲区归实时调用方所有，引擎只在一次 tick 调用内借用
pub struct TickTargets<'a> {
    sets: [&'a mut [EndpointTargets<'a>]; 2],
}

impl<'a> TickTargets<'a> {
    pub fn new(set0: &'a mut [EndpointTargets<'a>], set1: &'a mut [EndpointTargets<'a>]) -> Self {
        Self { sets: [set0, set1] }
    }

    #[inline]
    fn set_mut(&mut self, index: usize) -> &mut [EndpointTargets<'a>] {
        &mut *self.sets[index]
    }
}

/// 外部设备监视器持有的标志设置端
///
/// 监视器线程只做一件事：置位。tick 在自己的线程上 test-and-clear，
/// 除这个原子标志外没有任何状态跨越该线程边界
#[derive(Clone)]
pub struct FormatChangeHook {
    flag: Arc<CachePadded<AtomicBool>>,
}

impl FormatChangeHook {
    /// 标记"采样率可能已变化"，由下一次 tick 消费
    pub fn notify(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

struct OpenState<H> {
    arena: ArenaView,
    registers: RegisterTable,
    handles: NotificationHandleCache<H>,
}

struct Inner<C: ControlChannel> {
    channel: C,
    open: Option<OpenState<C::Handle>>,
}

/// 与驱动共享环形缓冲区的一次会话
///
/// 状态机：Closed → Open → Closed，没有中间持久状态。
/// tick 可以来自与 start/stop 不同的线程
pub struct Session<C: ControlChannel> {
    config: SessionConfig,
    inner: Mutex<Inner<C>>,
    format_change_pending: Arc<CachePadded<AtomicBool>>,
}

impl<C: ControlChannel> Session<C> {
    pub fn new(config: SessionConfig, channel: C) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                channel,
                open: None,
            }),
            format_change_pending: Arc::new(CachePadded::new(AtomicBool::new(false))),
        }
    }

    /// 设备变更回调用的标志设置端（可克隆、可跨线程）
    pub fn format_change_hook(&self) -> FormatChangeHook {
        FormatChangeHook {
            flag: Arc::clone(&self.format_change_pending),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<C>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 会话当前是否打开
    pub fn is_open(&self) -> bool {
        self.lock_inner().open.is_some()
    }

    /// 打开会话
    ///
    /// 打开控制通道 → 配置缓冲区布局 → 创建所有端点 → 可选启用
    /// 路由过滤器。除过滤器外任何一步失败都会回滚（等价于 stop）
    /// 并返回错误，绝不留下半开状态
    pub fn start(&self) -> Result<(), SessionError> {
        let mut inner = self.lock_inner();

        if inner.open.is_some() {
            return Err(SessionError::AlreadyOpen);
        }

        if let Err(e) = self.start_locked(&mut inner) {
            log::error!("session start failed: {}", e);
            Self::close_locked(&mut inner, &self.format_change_pending);
            return Err(e);
        }

        Ok(())
    }

    fn start_locked(&self, inner: &mut Inner<C>) -> Result<(), SessionError> {
        inner.channel.open()?;

        let request = BufferLayoutRequest {
            arena_size: self.config.buffer.arena_size,
            period_bytes_per_channel: self.config.buffer.period_bytes_per_channel() as u32,
            sample_rate: self.config.buffer.sample_rate,
            sample_size: self.config.buffer.sample_size,
            min_frame_count: self.config.min_frame_count.filter(|&n| n >= 2),
        };
        let response = inner.channel.set_buffer_layout(&request)?;

        let endpoint_count = self.config.endpoints.len();
        let table_bytes = endpoint_count * std::mem::size_of::<EndpointRegisters>();

        let Some(base) = NonNull::new(response.base) else {
            return Err(SessionError::BadLayout("null arena mapping"));
        };
        if response.register_offset % std::mem::align_of::<EndpointRegisters>() != 0 {
            return Err(SessionError::BadLayout("misaligned register table"));
        }
        if response
            .register_offset
            .checked_add(table_bytes)
            .map_or(true, |end| end > response.actual_size)
        {
            return Err(SessionError::BadLayout("register table exceeds arena"));
        }

        // Safety: 通道实现保证映射在 close() 前有效；close_locked 在
        // 关闭通道前先丢弃这两个视图
        let arena = unsafe { ArenaView::new(base, response.actual_size) };
        let registers =
            unsafe { RegisterTable::new(&arena, response.register_offset, endpoint_count) };

        for (index, endpoint) in self.config.endpoints.iter().enumerate() {
            let request = CreateEndpointRequest {
                kind: endpoint.kind,
                channel_count: endpoint.channel_count,
                index: index as u32,
                name: &endpoint.name,
                id: &endpoint.id,
            };

            if let Err(e) = inner.channel.create_endpoint(&request) {
                log::error!("endpoint creation for {} failed: {}", endpoint.name, e);
                return Err(e.into());
            }
        }

        if self.config.enable_routing_filter {
            if let Err(e) = inner.channel.enable_routing_filter() {
                log::error!("couldn't enable routing filter: {}", e);
            }
        }

        inner.open = Some(OpenState {
            arena,
            registers,
            handles: NotificationHandleCache::new(endpoint_count),
        });

        log::info!(
            "session started: {} endpoints, arena {} bytes",
            endpoint_count,
            response.actual_size
        );
        Ok(())
    }

    /// 关闭会话（幂等）
    ///
    /// 返回后保证：后续 tick 不再触碰共享内存；未决的句柄刷新被放弃
    /// （迟到的完成被忽略）；所有缓存的唤醒句柄已释放
    pub fn stop(&self) {
        let mut inner = self.lock_inner();
        Self::close_locked(&mut inner, &self.format_change_pending);
    }

    fn close_locked(inner: &mut Inner<C>, format_change_pending: &AtomicBool) {
        if let Some(open) = inner.open.take() {
            if open.handles.has_pending_request() {
                inner.channel.cancel_handle_batch();
            }
            // 句柄缓存和 arena/寄存器视图在通道关闭前丢弃
            drop(open);
            log::info!("session stopped");
        }

        inner.channel.close();
        format_change_pending.store(false, Ordering::Release);
    }

    /// 每个音频周期调用一次
    ///
    /// `buffer_index` ∈ {0, 1} 选择使用哪一组目标缓冲区。
    /// 会话关闭时立即返回，不触碰任何缓冲区
    pub fn tick(&self, buffer_index: usize, targets: &mut TickTargets<'_>) {
        debug_assert!(buffer_index < 2);

        // 锁中毒按会话已关闭处理：实时线程绝不 panic
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let Inner { channel, open } = &mut *inner;
        let Some(open) = open.as_mut() else {
            return;
        };

        if self.format_change_pending.swap(false, Ordering::AcqRel) {
            if let Err(e) = channel.send_format_change_event() {
                log::warn!("format change event failed: {}", e);
            }
        }

        let target_size = self.config.buffer.period_bytes_per_channel();
        let sample_size = self.config.buffer.sample_size as usize;
        let set = targets.set_mut(buffer_index & 1);
        let mut refreshed = false;

        for (index, endpoint) in self.config.endpoints.iter().enumerate() {
            let Some(target) = set.get_mut(index) else {
                break;
            };

            let snap = open.registers.snapshot(index);

            // 句柄过期检查先于有效性校验：一次刷新带回所有端点的更新，
            // 每个 tick 至多发起一次
            if !refreshed
                && snap.notification_count != 0
                && generation_number(snap.generation)
                    != generation_number(open.handles.generation(index))
            {
                open.handles.refresh(channel);
                refreshed = true;
            }

            // 无效端点（无客户端/配置异常）：静音输出，位置不动
            if !snap.is_valid(open.arena.len()) {
                silence(target, target_size);
                continue;
            }

            let chunk = target_size * snap.active_channel_count as usize;

            // 块大小超出端点窗口按无效处理，防止越界访问
            if chunk > snap.buffer_size as usize {
                silence(target, target_size);
                continue;
            }

            let next_position = ((snap.position_register as u64 + chunk as u64)
                % snap.buffer_size as u64) as u32;
            let window =
                RingWindow::new(snap.buffer_offset as usize, snap.buffer_size as usize);
            let spans = window.span_pair(snap.position_register as usize, chunk);

            match endpoint.kind {
                EndpointKind::Playback => demux(
                    &open.arena,
                    &spans,
                    &mut *target.channels,
                    snap.active_channel_count as usize,
                    target_size,
                    sample_size,
                ),
                EndpointKind::Recording => mux(
                    &open.arena,
                    &spans,
                    &mut *target.channels,
                    snap.active_channel_count as usize,
                    target_size,
                    sample_size,
                ),
            }

            // 拷贝后的二次校验：期间驱动重配置过端点，刚拷的数据可能
            // 撕裂——丢弃并静音，位置不动。这是正常工况，不是错误
            let late_generation = open.registers.generation(index);
            if !generation_is_active(late_generation)
                || generation_number(late_generation) != generation_number(snap.generation)
            {
                silence(target, target_size);
                continue;
            }

            // 唤醒点检测：notification_count >= 1 时回绕处唤醒，
            // >= 2 时中点也唤醒。前提 chunk <= size/2，每周期至多一处
            let half = snap.buffer_size / 2;
            let crossed_end = snap.notification_count >= 1
                && snap.position_register >= half
                && next_position < half;
            let crossed_mid = snap.notification_count >= 2
                && snap.position_register < half
                && next_position >= half;

            if crossed_end || crossed_mid {
                match open
                    .handles
                    .usable(index, generation_number(snap.generation))
                {
                    Some(handle) => {
                        // 先推进位置再唤醒，消费者醒来看到的是新位置
                        open.registers.set_position(index, next_position);
                        if let Err(e) = handle.signal() {
                            log::error!("wake signal for endpoint {} failed: {}", index, e);
                        }
                    }
                    None => {
                        // 句柄已过期：丢弃本周期数据，位置冻结等待新句柄
                        silence(target, target_size);
                    }
                }
            } else {
                open.registers.set_position(index, next_position);
            }
        }
    }
}

impl<C: ControlChannel> Drop for Session<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 把端点本周期的所有目标声道清零
fn silence(target: &mut EndpointTargets<'_>, target_size: usize) {
    for channel in target.channels.iter_mut() {
        if let Some(buf) = channel.as_deref_mut() {
            let limit = target_size.min(buf.len());
            buf[..limit].fill(0);
        }
    }
}
