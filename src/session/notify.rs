//! 唤醒句柄缓存与异步刷新
//!
//! 每个端点一个槽位 (generation, handle)：驱动重配置端点后旧句柄
//! 作废，新句柄通过"下一批句柄"请求异步送达。刷新是一个两态小任务
//! （空闲/未决），每个 tick 至多推进一次，绝不阻塞实时路径：
//! - 空闲：发起请求；同步完成就地处理，受理则转未决，没发出去下周期重试
//! - 未决：非阻塞轮询；就绪则处理并立刻再发起一次；失败回到空闲重试
//!
//! 一次请求会带回所有过期端点的更新，所以每个 tick 只需要一次刷新，
//! 无论有多少端点同时过期

use crate::driver::{BatchPoll, BatchRequest, ControlChannel, HandleUpdate, WakeHandle};
use crate::shm::registers::generation_number;

struct HandleSlot<H> {
    /// 句柄签发时的 generation；tag 与寄存器当前值一致时句柄才可用
    generation: u32,
    handle: Option<H>,
}

pub(crate) struct NotificationHandleCache<H> {
    slots: Vec<HandleSlot<H>>,
    /// 是否有一个批量请求仍未完成
    pending: bool,
}

impl<H: WakeHandle> NotificationHandleCache<H> {
    pub fn new(endpoint_count: usize) -> Self {
        let slots = (0..endpoint_count)
            .map(|_| HandleSlot {
                generation: 0,
                handle: None,
            })
            .collect();

        Self {
            slots,
            pending: false,
        }
    }

    /// 槽位当前缓存的 generation（无句柄时为 0）
    #[inline]
    pub fn generation(&self, index: usize) -> u32 {
        self.slots.get(index).map(|s| s.generation).unwrap_or(0)
    }

    /// 取端点可用的句柄：存在且签发 tag 与 `wanted_tag` 一致
    pub fn usable(&self, index: usize, wanted_tag: u32) -> Option<&H> {
        let slot = self.slots.get(index)?;
        let handle = slot.handle.as_ref()?;

        if generation_number(slot.generation) == wanted_tag {
            Some(handle)
        } else {
            None
        }
    }

    /// 推进刷新任务一步（每 tick 至多调用一次）
    pub fn refresh<C>(&mut self, channel: &mut C)
    where
        C: ControlChannel<Handle = H>,
    {
        if self.pending {
            match channel.poll_handle_batch() {
                BatchPoll::Ready(updates) => {
                    self.apply(updates);
                    // 处理完立刻再排一个请求，落入下方的发起逻辑
                }
                BatchPoll::NotReady => return,
                BatchPoll::Failed => {
                    // tick/stop 竞争下的失败是预期情况，下个周期重试
                    self.pending = false;
                    return;
                }
            }
        }

        match channel.request_handle_batch() {
            BatchRequest::Completed(updates) => {
                self.apply(updates);
                self.pending = false;
            }
            BatchRequest::Pending => self.pending = true,
            BatchRequest::Failed => {
                log::debug!("wake handle batch request failed to start, will retry");
                self.pending = false;
            }
        }
    }

    fn apply(&mut self, updates: Vec<HandleUpdate<H>>) {
        for update in updates {
            let Some(slot) = self.slots.get_mut(update.endpoint_index as usize) else {
                log::warn!(
                    "ignoring wake handle for out-of-range endpoint {}",
                    update.endpoint_index
                );
                continue;
            };

            // 覆盖即释放：旧句柄在这里被 Drop 恰好一次
            slot.generation = update.generation;
            slot.handle = Some(update.handle);
        }
    }

    /// 是否仍有未决的批量请求（stop 时据此取消）
    #[inline]
    pub fn has_pending_request(&self) -> bool {
        self.pending
    }
}
