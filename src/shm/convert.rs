//! 交织/解交织样本搬运（mux/demux）
//!
//! 共享环里的数据是交织流（c0 c1 c2 c0 c1 c2 ...），外部周期缓冲区
//! 是每声道独立的平面数组。两个方向共用同一套寻址：
//! - 步长 = sample_size × source_channels
//! - 声道 c 的起点 = first.offset + sample_size × c
//! - first 段恰好耗尽时无缝切到 second 段
//!
//! 声道数不匹配时：
//! - demux：source < target 的多余目标声道整体清零；source > target
//!   的多余源声道被丢弃
//! - mux：没有对应的清零步骤，环里未被覆盖的声道保持原样
//!   （沿用驱动协议的既有行为，见 DESIGN.md）

use super::arena::{ArenaView, SpanPair};

/// 环 → 每声道缓冲区（播放端点）
///
/// `targets` 中为 `None` 的声道跳过；每个目标最多写入
/// `target_size` 字节，源片段对耗尽时提前结束
pub fn demux(
    arena: &ArenaView,
    spans: &SpanPair,
    targets: &mut [Option<&mut [u8]>],
    source_channels: usize,
    target_size: usize,
    sample_size: usize,
) {
    let stride = sample_size * source_channels;
    let processed = source_channels.min(targets.len());

    if sample_size > 0 {
        for (c, target) in targets.iter_mut().enumerate().take(processed) {
            let Some(target) = target.as_deref_mut() else {
                continue;
            };
            let limit = target_size.min(target.len());

            let mut offset = spans.first.offset + sample_size * c;
            let mut remaining = spans.first.len;
            let mut j = 0;

            while j + sample_size <= limit && remaining >= stride {
                arena.read_bytes(offset, &mut target[j..j + sample_size]);
                offset += stride;
                remaining -= stride;
                j += sample_size;

                if remaining == 0 {
                    offset = spans.second.offset + sample_size * c;
                    remaining = spans.second.len;
                }
            }
        }
    }

    // 源中不存在的目标声道整体静音
    for target in targets.iter_mut().skip(processed) {
        if let Some(target) = target.as_deref_mut() {
            let limit = target_size.min(target.len());
            target[..limit].fill(0);
        }
    }
}

/// 每声道缓冲区 → 环（录音端点）
///
/// 与 demux 同一套寻址，方向相反；多余的环内声道不清零
pub fn mux(
    arena: &ArenaView,
    spans: &SpanPair,
    sources: &mut [Option<&mut [u8]>],
    ring_channels: usize,
    source_size: usize,
    sample_size: usize,
) {
    let stride = sample_size * ring_channels;
    let processed = ring_channels.min(sources.len());

    if sample_size == 0 {
        return;
    }

    for (c, source) in sources.iter_mut().enumerate().take(processed) {
        let Some(source) = source.as_deref_mut() else {
            continue;
        };
        let limit = source_size.min(source.len());

        let mut offset = spans.first.offset + sample_size * c;
        let mut remaining = spans.first.len;
        let mut j = 0;

        while j + sample_size <= limit && remaining >= stride {
            arena.write_bytes(offset, &source[j..j + sample_size]);
            offset += stride;
            remaining -= stride;
            j += sample_size;

            if remaining == 0 {
                offset = spans.second.offset + sample_size * c;
                remaining = spans.second.len;
            }
        }
    }
}
