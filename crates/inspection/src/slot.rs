use std::sync::{Arc, Mutex, PoisonError};

use video_ingest::Frame;

/// Most-recent-wins hand-off between the capture loop and the dispatcher.
///
/// Holds at most one frame. `publish` overwrites whatever is stored; frames the
/// dispatcher never saw are dropped on purpose, inference being the slow side.
/// The lock is held only for the pointer swap or the `Arc` clone, never across
/// camera reads or network calls.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<Mutex<Option<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        let previous = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard.replace(frame)
        };
        // Release the old pixels outside the critical section.
        drop(previous);
    }

    /// Snapshot of the stored frame, or `None` before the first publish.
    pub fn latest(&self) -> Option<Frame> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use video_ingest::FrameFormat;

    use super::*;

    fn frame(ts: i64) -> Frame {
        Frame::with_timestamp(vec![0; 3], 1, 1, FrameFormat::Rgb8, ts).unwrap()
    }

    #[test]
    fn empty_until_first_publish() {
        assert!(FrameSlot::new().latest().is_none());
    }

    #[test]
    fn publish_overwrites_previous_frame() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        slot.publish(frame(2));
        slot.publish(frame(3));
        assert_eq!(slot.latest().unwrap().timestamp_ms, 3);
        // Reading does not consume.
        assert_eq!(slot.latest().unwrap().timestamp_ms, 3);
    }

    #[test]
    fn reader_sees_latest_after_writer_thread_finishes() {
        let slot = FrameSlot::new();
        let writer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for ts in 0..500 {
                    slot.publish(frame(ts));
                }
            })
        };
        let mut last_seen = -1;
        while !writer.is_finished() {
            if let Some(frame) = slot.latest() {
                assert!(frame.timestamp_ms >= last_seen);
                last_seen = frame.timestamp_ms;
            }
        }
        writer.join().unwrap();
        assert_eq!(slot.latest().unwrap().timestamp_ms, 499);
    }
}
