//! 分片重组队列
//!
//! BLE 通知会把一个逻辑帧拆成多段，也可能在一次通知中带来多个帧。
//! 队列缓存收到的字节，并反复调用帧处理函数，直到缓冲区不足一帧。
//!
//! 协议没有帧边界标记，所以解码失步时只能丢弃整个缓冲区。

use log::{trace, warn};

/// 帧处理函数的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    /// 数据不足，等待下一次通知
    NeedMore,
    /// 处理了一个帧，从缓冲区头部移除这么多字节
    Bytes(usize),
    /// 未知命令或致命解码错误，丢弃全部缓冲数据
    InvalidateAll,
}

/// 单次 [`ChunkQueue::process`] 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    /// 处理的完整帧数量
    pub frames: usize,
    /// 缓冲区是否被整体丢弃
    pub invalidated: bool,
    /// 缓冲数据超过上限而被丢弃 (处理函数未被调用)
    pub overflowed: bool,
}

/// 按会话持有的重组缓冲区
#[derive(Debug)]
pub struct ChunkQueue {
    buffer: Vec<u8>,
    max_buffered: usize,
}

impl ChunkQueue {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffered,
        }
    }

    /// 追加收到的字节并处理所有完整帧
    pub fn process<F>(&mut self, received: &[u8], mut handler: F) -> Drained
    where
        F: FnMut(&[u8]) -> Consumed,
    {
        let mut drained = Drained::default();
        self.buffer.extend_from_slice(received);

        if self.buffer.len() > self.max_buffered {
            warn!(
                "Reassembly buffer exceeded {} bytes, discarding",
                self.max_buffered
            );
            self.buffer.clear();
            drained.invalidated = true;
            drained.overflowed = true;
            return drained;
        }

        while !self.buffer.is_empty() {
            match handler(&self.buffer) {
                Consumed::NeedMore | Consumed::Bytes(0) => break,
                Consumed::Bytes(n) => {
                    let n = n.min(self.buffer.len());
                    trace!("Frame consumed {} of {} buffered bytes", n, self.buffer.len());
                    self.buffer.drain(..n);
                    drained.frames += 1;
                }
                Consumed::InvalidateAll => {
                    warn!("Invalidating {} buffered bytes", self.buffer.len());
                    self.buffer.clear();
                    drained.invalidated = true;
                    break;
                }
            }
        }

        drained
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试用的帧格式: 长度字节 + 内容；0xff 表示非法
    fn length_prefixed(frames: &mut Vec<Vec<u8>>) -> impl FnMut(&[u8]) -> Consumed + '_ {
        move |buf: &[u8]| {
            if buf[0] == 0xff {
                return Consumed::InvalidateAll;
            }
            let len = 1 + buf[0] as usize;
            if buf.len() < len {
                return Consumed::NeedMore;
            }
            frames.push(buf[1..len].to_vec());
            Consumed::Bytes(len)
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut frames = Vec::new();
        let mut queue = ChunkQueue::new(1024);
        let data = [3, b'a', b'b', b'c'];

        for b in &data[..3] {
            let drained = queue.process(&[*b], length_prefixed(&mut frames));
            assert_eq!(drained.frames, 0);
        }
        let drained = queue.process(&data[3..], length_prefixed(&mut frames));

        assert_eq!(drained.frames, 1);
        assert_eq!(frames, vec![b"abc".to_vec()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_delivery() {
        let mut frames = Vec::new();
        let mut queue = ChunkQueue::new(1024);

        let drained = queue.process(&[1, b'x', 2, b'y', b'z', 4, b'p'], length_prefixed(&mut frames));

        assert_eq!(drained.frames, 2);
        assert_eq!(frames, vec![b"x".to_vec(), b"yz".to_vec()]);
        // 第三帧不完整，保留在缓冲区
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_invalidate_drops_everything() {
        let mut frames = Vec::new();
        let mut queue = ChunkQueue::new(1024);

        let drained = queue.process(&[0xff, 1, b'x'], length_prefixed(&mut frames));

        assert!(drained.invalidated);
        assert!(frames.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_guard() {
        let mut frames = Vec::new();
        let mut queue = ChunkQueue::new(4);

        let drained = queue.process(&[200, 1, 2, 3, 4, 5], length_prefixed(&mut frames));

        assert!(drained.invalidated);
        assert!(drained.overflowed);
        assert!(queue.is_empty());
    }
}
