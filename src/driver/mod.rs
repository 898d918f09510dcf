//! 驱动控制通道边界
//!
//! 内核驱动通过一条控制通道接受固定形状的请求/响应，传输机制
//! 对本 crate 不可见（设备 ioctl、测试替身……都隐藏在 trait 之后）。
//! 包含：
//! - ControlChannel: 控制通道操作集合
//! - WakeHandle: 驱动下发的 OS 级唤醒原语
//! - 唤醒句柄批量刷新协议的两阶段结果类型
//!
//! tick 路径上只允许出现非阻塞调用（request/poll/cancel）；
//! 其余操作只能在控制线程的 start/stop 里使用

use thiserror::Error;

#[cfg(test)]
pub(crate) mod mock;

/// 控制通道调用失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("control channel is not open")]
    NotOpen,
    #[error("control request failed (status {0})")]
    RequestFailed(i32),
    #[error("control channel unavailable: {0}")]
    Unavailable(&'static str),
}

/// 唤醒句柄 signal 失败（记录日志即可，不影响位置推进）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wake signal failed (status {0})")]
pub struct SignalError(pub i32);

/// 端点类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// 应用向端点写入，本引擎从环中读出（demux）
    Playback,
    /// 本引擎向环中写入（mux），应用从端点读取
    Recording,
}

/// SetBufferLayout 请求
#[derive(Clone, Copy, Debug)]
pub struct BufferLayoutRequest {
    /// 期望的 arena 字节数
    pub arena_size: u32,
    /// 每声道每周期的字节数
    pub period_bytes_per_channel: u32,
    pub sample_rate: u32,
    pub sample_size: u32,
    /// WaveRT 最小帧数（>= 2 时才下发）
    pub min_frame_count: Option<u32>,
}

/// SetBufferLayout 响应：驱动建立好的映射
#[derive(Clone, Copy, Debug)]
pub struct BufferLayoutResponse {
    /// 映射基址。实现方保证其在 `close()` 之前一直有效
    pub base: *mut u8,
    /// 实际映射的字节数（可能大于请求值）
    pub actual_size: usize,
    /// 端点寄存器表在映射内的偏移
    pub register_offset: usize,
}

/// CreateEndpoint 请求
#[derive(Clone, Debug)]
pub struct CreateEndpointRequest<'a> {
    pub kind: EndpointKind,
    pub channel_count: u32,
    pub index: u32,
    pub name: &'a str,
    pub id: &'a str,
}

/// 批量刷新返回的一条句柄更新
#[derive(Debug)]
pub struct HandleUpdate<H> {
    pub endpoint_index: u32,
    /// 句柄签发时的 generation（含 active 位，比较时只看 tag）
    pub generation: u32,
    pub handle: H,
}

/// 发起批量刷新请求的结果
#[derive(Debug)]
pub enum BatchRequest<H> {
    /// 同步完成，结果就地返回
    Completed(Vec<HandleUpdate<H>>),
    /// 已受理，稍后用 poll 收取
    Pending,
    /// 请求根本没能发出（下个周期重试）
    Failed,
}

/// 轮询未决批量请求的结果
#[derive(Debug)]
pub enum BatchPoll<H> {
    Ready(Vec<HandleUpdate<H>>),
    NotReady,
    /// 操作失败（tick/stop 竞争时可能出现，不算错误）
    Failed,
}

/// 驱动下发的 OS 级唤醒原语
///
/// 所有权在客户端：替换或会话停止时靠 Drop 恰好释放一次
pub trait WakeHandle: Send {
    /// 唤醒共享此句柄的外部消费者
    fn signal(&self) -> Result<(), SignalError>;
}

/// 驱动控制通道
///
/// 实现方约定：`set_buffer_layout` 返回的映射在 `close()` 调用前
/// 保持有效；`close` 后任何操作返回 `ControlError::NotOpen`
pub trait ControlChannel {
    type Handle: WakeHandle;

    /// 打开到驱动的控制通道（阻塞，仅限控制线程）
    fn open(&mut self) -> Result<(), ControlError>;

    /// 关闭控制通道并使映射失效，可重复调用
    fn close(&mut self);

    /// 配置共享缓冲区布局，取得 arena 映射和寄存器表偏移
    fn set_buffer_layout(
        &mut self,
        request: &BufferLayoutRequest,
    ) -> Result<BufferLayoutResponse, ControlError>;

    /// 在驱动侧创建一个端点
    fn create_endpoint(&mut self, request: &CreateEndpointRequest<'_>) -> Result<(), ControlError>;

    /// 启用应用路由过滤器
    fn enable_routing_filter(&mut self) -> Result<(), ControlError>;

    /// 让驱动广播一次格式可能变化的事件
    fn send_format_change_event(&mut self) -> Result<(), ControlError>;

    /// 发起一次"下一批唤醒句柄"请求（非阻塞）
    fn request_handle_batch(&mut self) -> BatchRequest<Self::Handle>;

    /// 非阻塞轮询未决的批量请求
    fn poll_handle_batch(&mut self) -> BatchPoll<Self::Handle>;

    /// 放弃未决的批量请求（stop 路径；迟到的完成会被忽略）
    fn cancel_handle_batch(&mut self);
}
