//! 测试用内存驱动
//!
//! 用一块进程内的 arena 模拟内核驱动：测试可以直接改写端点寄存器、
//! 预排批量刷新的结果、统计各控制操作的调用次数。
//! `bump_generation_on_request` 用来确定性地复现"拷贝期间驱动重配置"
//! 的竞争窗口：句柄刷新发生在快照之后、拷贝之前。

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    BatchPoll, BatchRequest, BufferLayoutRequest, BufferLayoutResponse, ControlError,
    CreateEndpointRequest, HandleUpdate, SignalError, WakeHandle,
};
use crate::shm::registers::{generation_number, EndpointRegisters, GENERATION_ACTIVE_FLAG};

/// 预排的批量刷新结果：(endpoint_index, generation) 列表或状态
#[derive(Debug, Clone)]
pub(crate) enum ScriptedBatch {
    Completed(Vec<(u32, u32)>),
    Pending,
    Failed,
}

pub(crate) struct MockState {
    arena: Vec<u64>,
    arena_bytes: usize,
    pub register_offset: usize,
    pub endpoint_count: usize,

    pub open: bool,
    pub fail_layout: bool,
    pub fail_create: bool,

    /// request_handle_batch 的脚本；耗尽后默认 Completed([])
    pub request_script: VecDeque<ScriptedBatch>,
    /// poll_handle_batch 的脚本；耗尽后默认 NotReady
    pub poll_script: VecDeque<ScriptedBatch>,
    /// 发起批量请求时把该端点的 generation tag +1（模拟竞争窗口）
    pub bump_generation_on_request: Option<usize>,
    /// 之后签发的句柄 signal 一律失败
    pub fail_signal_handles: bool,

    pub layout_calls: usize,
    pub batch_requests: usize,
    pub batch_polls: usize,
    pub cancels: usize,
    pub format_change_events: usize,
    pub created_endpoints: Vec<(u32, u32)>,

    /// 所有存活的 MockHandle 计数（Drop 时递减）
    pub live_handles: Arc<AtomicUsize>,
    /// signal 调用总数
    pub signals: Arc<AtomicUsize>,
}

impl MockState {
    fn reg_ptr(&mut self, index: usize) -> *mut EndpointRegisters {
        assert!(index < self.endpoint_count);
        let base = self.arena.as_mut_ptr() as *mut u8;
        unsafe { base.add(self.register_offset) as *mut EndpointRegisters }
            .wrapping_add(index)
    }

    pub fn set_registers(&mut self, index: usize, regs: EndpointRegisters) {
        unsafe { std::ptr::write_volatile(self.reg_ptr(index), regs) }
    }

    pub fn registers(&mut self, index: usize) -> EndpointRegisters {
        unsafe { std::ptr::read_volatile(self.reg_ptr(index)) }
    }

    /// 直接构造一个激活端点寄存器
    pub fn activate(
        &mut self,
        index: usize,
        tag: u32,
        channels: u32,
        offset: u32,
        size: u32,
        notification_count: u32,
        position: u32,
    ) {
        self.set_registers(
            index,
            EndpointRegisters {
                generation: GENERATION_ACTIVE_FLAG | tag,
                active_channel_count: channels,
                buffer_offset: offset,
                buffer_size: size,
                notification_count,
                position_register: position,
            },
        );
    }

    pub fn write_arena(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.arena_bytes);
        let base = self.arena.as_mut_ptr() as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len()) }
    }

    pub fn read_arena(&mut self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.arena_bytes);
        let mut out = vec![0u8; len];
        let base = self.arena.as_mut_ptr() as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), len) }
        out
    }

    fn new_handle(&self) -> MockHandle {
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        MockHandle {
            signals: Arc::clone(&self.signals),
            live: Arc::clone(&self.live_handles),
            fail_signal: self.fail_signal_handles,
        }
    }

    fn materialize(&mut self, script: ScriptedBatch) -> Option<Vec<HandleUpdate<MockHandle>>> {
        match script {
            ScriptedBatch::Completed(entries) => Some(
                entries
                    .into_iter()
                    .map(|(endpoint_index, generation)| HandleUpdate {
                        endpoint_index,
                        generation,
                        handle: self.new_handle(),
                    })
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// 测试用唤醒句柄：统计 signal 次数，Drop 时递减存活计数
pub(crate) struct MockHandle {
    signals: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    pub fail_signal: bool,
}

impl WakeHandle for MockHandle {
    fn signal(&self) -> Result<(), SignalError> {
        if self.fail_signal {
            return Err(SignalError(-5));
        }
        self.signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new(arena_bytes: usize, register_offset: usize, endpoint_count: usize) -> Self {
        assert_eq!(register_offset % std::mem::align_of::<EndpointRegisters>(), 0);
        assert!(
            register_offset + endpoint_count * std::mem::size_of::<EndpointRegisters>()
                <= arena_bytes
        );

        let state = MockState {
            arena: vec![0u64; arena_bytes.div_ceil(8)],
            arena_bytes,
            register_offset,
            endpoint_count,
            open: false,
            fail_layout: false,
            fail_create: false,
            request_script: VecDeque::new(),
            poll_script: VecDeque::new(),
            bump_generation_on_request: None,
            fail_signal_handles: false,
            layout_calls: 0,
            batch_requests: 0,
            batch_polls: 0,
            cancels: 0,
            format_change_events: 0,
            created_endpoints: Vec::new(),
            live_handles: Arc::new(AtomicUsize::new(0)),
            signals: Arc::new(AtomicUsize::new(0)),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// 测试侧的状态手柄（arena 在构造时分配，地址稳定）
    pub fn state(&self) -> Arc<Mutex<MockState>> {
        Arc::clone(&self.state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock driver state poisoned")
    }
}

impl super::ControlChannel for MockDriver {
    type Handle = MockHandle;

    fn open(&mut self) -> Result<(), ControlError> {
        self.lock().open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().open = false;
    }

    fn set_buffer_layout(
        &mut self,
        _request: &BufferLayoutRequest,
    ) -> Result<BufferLayoutResponse, ControlError> {
        let mut state = self.lock();
        state.layout_calls += 1;

        if !state.open {
            return Err(ControlError::NotOpen);
        }
        if state.fail_layout {
            return Err(ControlError::RequestFailed(-2));
        }

        let base = NonNull::new(state.arena.as_mut_ptr() as *mut u8).unwrap();
        Ok(BufferLayoutResponse {
            base: base.as_ptr(),
            actual_size: state.arena_bytes,
            register_offset: state.register_offset,
        })
    }

    fn create_endpoint(&mut self, request: &CreateEndpointRequest<'_>) -> Result<(), ControlError> {
        let mut state = self.lock();

        if !state.open {
            return Err(ControlError::NotOpen);
        }
        if state.fail_create {
            return Err(ControlError::RequestFailed(-3));
        }

        state
            .created_endpoints
            .push((request.index, request.channel_count));
        Ok(())
    }

    fn enable_routing_filter(&mut self) -> Result<(), ControlError> {
        if !self.lock().open {
            return Err(ControlError::NotOpen);
        }
        Ok(())
    }

    fn send_format_change_event(&mut self) -> Result<(), ControlError> {
        let mut state = self.lock();
        if !state.open {
            return Err(ControlError::NotOpen);
        }
        state.format_change_events += 1;
        Ok(())
    }

    fn request_handle_batch(&mut self) -> BatchRequest<MockHandle> {
        let mut state = self.lock();
        state.batch_requests += 1;

        if let Some(index) = state.bump_generation_on_request {
            let mut regs = state.registers(index);
            let bumped = generation_number(regs.generation).wrapping_add(1) & !GENERATION_ACTIVE_FLAG;
            regs.generation = (regs.generation & GENERATION_ACTIVE_FLAG) | bumped;
            state.set_registers(index, regs);
        }

        let script = state
            .request_script
            .pop_front()
            .unwrap_or(ScriptedBatch::Completed(Vec::new()));

        match script {
            ScriptedBatch::Pending => BatchRequest::Pending,
            ScriptedBatch::Failed => BatchRequest::Failed,
            completed => BatchRequest::Completed(state.materialize(completed).unwrap()),
        }
    }

    fn poll_handle_batch(&mut self) -> BatchPoll<MockHandle> {
        let mut state = self.lock();
        state.batch_polls += 1;

        let script = state
            .poll_script
            .pop_front()
            .unwrap_or(ScriptedBatch::Pending);

        match script {
            ScriptedBatch::Pending => BatchPoll::NotReady,
            ScriptedBatch::Failed => BatchPoll::Failed,
            completed => BatchPoll::Ready(state.materialize(completed).unwrap()),
        }
    }

    fn cancel_handle_batch(&mut self) {
        self.lock().cancels += 1;
    }
}
