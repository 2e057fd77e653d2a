//! In-memory mirror of a persistent stack.

use crate::frame::PositionedFrame;

/// Tail-only sequence of positioned frames mirroring one stack region.
///
/// The mirror is the fast path for "which frame are we in". It is rebuilt
/// from durable bytes by [`read_stack`](crate::stack::read_stack) after a
/// crash and otherwise changes only together with the region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RamStack {
    frames: Vec<PositionedFrame>,
}

impl RamStack {
    /// Create an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset one past the last frame, or 0 when empty.
    pub fn get_stack_end(&self) -> u64 {
        self.frames.last().map_or(0, PositionedFrame::end)
    }

    /// Append a frame.
    pub fn add_frame(&mut self, frame: PositionedFrame) {
        debug_assert!(
            self.frames
                .last()
                .map_or(true, |last| frame.position >= last.next_position()),
            "frames must be appended in increasing, aligned order"
        );
        self.frames.push(frame);
    }

    /// Pop the last frame. Refusing to pop the root is the call engine's job.
    pub fn remove_frame(&mut self) -> Option<PositionedFrame> {
        self.frames.pop()
    }

    /// The most recently pushed frame.
    pub fn get_last_frame(&self) -> Option<&PositionedFrame> {
        self.frames.last()
    }

    /// Offset of the second-to-last frame's answer slot.
    ///
    /// This is where the running function deposits its return value for
    /// the caller. `None` when there is no caller.
    pub fn get_answer_position(&self) -> Option<u64> {
        let len = self.frames.len();
        if len < 2 {
            return None;
        }
        Some(self.frames[len - 2].answer_offset())
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame is present.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames from the root to the top.
    pub fn iter(&self) -> impl Iterator<Item = &PositionedFrame> {
        self.frames.iter()
    }

    /// Function names from the root to the top.
    pub fn function_names(&self) -> Vec<&str> {
        self.frames.iter().map(|f| f.frame.function_name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StackFrame;

    fn positioned(name: &str, position: u64) -> PositionedFrame {
        PositionedFrame::new(StackFrame::new(name, vec![1, 2]).unwrap(), position)
    }

    #[test]
    fn test_empty() {
        let stack = RamStack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.get_stack_end(), 0);
        assert!(stack.get_last_frame().is_none());
        assert!(stack.get_answer_position().is_none());
    }

    #[test]
    fn test_tail_operations() {
        let mut stack = RamStack::new();
        stack.add_frame(positioned("root", 0));
        assert_eq!(stack.get_stack_end(), 13 + 4 + 2);
        assert!(stack.get_answer_position().is_none());

        stack.add_frame(positioned("f", 64));
        stack.add_frame(positioned("g", 128));
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.get_answer_position(), Some(64));
        assert_eq!(stack.get_last_frame().unwrap().frame.function_name(), "g");
        assert_eq!(stack.function_names(), vec!["root", "f", "g"]);

        let popped = stack.remove_frame().unwrap();
        assert_eq!(popped.position, 128);
        assert_eq!(stack.get_answer_position(), Some(0));
        assert_eq!(stack.get_stack_end(), 64 + 13 + 1 + 2);
    }
}
