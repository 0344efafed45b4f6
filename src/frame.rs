// Frame synchronizer
//
// Drives one frame per call through wait -> acquire -> submit -> present,
// rotating over a fixed number of frame slots. The GPU side is reached
// through `FrameTarget`, so the protocol itself runs without a device.

use anyhow::Result;

/// Result of asking the presentation engine for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image(u32),
    /// Surface no longer matches the swapchain
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presented {
    Done,
    Stale,
}

/// GPU operations the synchronizer sequences, addressed by frame slot
pub trait FrameTarget {
    /// Block until the slot's previous submission has finished
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next image, signalling the slot's image-available semaphore
    fn acquire(&mut self, slot: usize) -> Result<Acquired>;

    /// Unsignal the slot's fence ahead of a submission
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    /// Submit the image's commands, arming the slot's fence
    fn submit(&mut self, slot: usize, image: u32) -> Result<()>;

    fn present(&mut self, slot: usize, image: u32) -> Result<Presented>;

    /// Replace the swapchain resource set. Leaves the device idle.
    fn rebuild(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle(usize),
    Acquiring(usize),
    Submitted { slot: usize, image: u32 },
    Presenting { slot: usize, image: u32 },
}

impl FrameState {
    pub fn slot(&self) -> usize {
        match *self {
            Self::Idle(slot) | Self::Acquiring(slot) => slot,
            Self::Submitted { slot, .. } | Self::Presenting { slot, .. } => slot,
        }
    }
}

/// What one `draw_frame` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image: u32 },
    /// The swapchain was rebuilt and nothing was drawn
    Rebuilt,
}

pub struct FrameSynchronizer {
    frames_in_flight: usize,
    state: FrameState,
    rebuild_pending: bool,
}

impl FrameSynchronizer {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            state: FrameState::Idle(0),
            rebuild_pending: false,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Rebuild at the start of the next frame instead of drawing it
    pub fn request_rebuild(&mut self) {
        self.rebuild_pending = true;
    }

    /// Run one iteration of the frame loop.
    ///
    /// The slot only advances after a present. A rebuild ends the iteration
    /// with the slot unchanged and its fence still signalled.
    pub fn draw_frame<T: FrameTarget>(&mut self, target: &mut T) -> Result<FrameOutcome> {
        let slot = self.state.slot();
        self.state = FrameState::Idle(slot);

        if self.rebuild_pending {
            self.rebuild_pending = false;
            target.rebuild()?;
            return Ok(FrameOutcome::Rebuilt);
        }

        target.wait_for_slot(slot)?;

        self.state = FrameState::Acquiring(slot);
        let image = match target.acquire(slot)? {
            Acquired::Image(image) => image,
            Acquired::Stale => {
                log::debug!("Acquire on slot {} hit a stale swapchain", slot);
                target.rebuild()?;
                self.state = FrameState::Idle(slot);
                return Ok(FrameOutcome::Rebuilt);
            }
        };

        // Reset only now: an iteration that bails out above must leave the fence signalled
        target.reset_slot(slot)?;
        target.submit(slot, image)?;
        self.state = FrameState::Submitted { slot, image };

        self.state = FrameState::Presenting { slot, image };
        if target.present(slot, image)? == Presented::Stale {
            log::debug!("Present of image {} hit a stale swapchain", image);
            self.rebuild_pending = true;
        }

        self.state = FrameState::Idle((slot + 1) % self.frames_in_flight);
        Ok(FrameOutcome::Presented { slot, image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Reset,
        Pending,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Waited { slot: usize, blocked: bool },
        Acquired { slot: usize, image: u32 },
        Submitted { slot: usize, image: u32 },
        Presented { slot: usize, image: u32 },
        Rebuilt,
    }

    /// Simulated GPU timeline: a pending submission completes when its slot is waited on
    struct MockGpu {
        fences: Vec<FenceState>,
        image_count: u32,
        next_image: u32,
        stale_acquires: VecDeque<bool>,
        stale_presents: VecDeque<bool>,
        events: Vec<Event>,
        max_in_flight: usize,
    }

    impl MockGpu {
        fn new(slots: usize, image_count: u32) -> Self {
            Self {
                fences: vec![FenceState::Signaled; slots],
                image_count,
                next_image: 0,
                stale_acquires: VecDeque::new(),
                stale_presents: VecDeque::new(),
                events: Vec::new(),
                max_in_flight: 0,
            }
        }

        fn in_flight(&self) -> usize {
            self.fences
                .iter()
                .filter(|&&f| f == FenceState::Pending)
                .count()
        }

        fn rebuilds(&self) -> usize {
            self.events.iter().filter(|e| **e == Event::Rebuilt).count()
        }

        fn all_fences_signaled(&self) -> bool {
            self.fences.iter().all(|f| *f == FenceState::Signaled)
        }

        fn submissions(&self) -> Vec<usize> {
            self.events
                .iter()
                .enumerate()
                .filter(|(_, e)| matches!(e, Event::Submitted { .. }))
                .map(|(i, _)| i)
                .collect()
        }
    }

    impl FrameTarget for MockGpu {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            let blocked = match self.fences[slot] {
                FenceState::Pending => true,
                FenceState::Signaled => false,
                FenceState::Reset => panic!("slot {slot} waits on a fence nothing will signal"),
            };
            self.fences[slot] = FenceState::Signaled;
            self.events.push(Event::Waited { slot, blocked });
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> Result<Acquired> {
            if self.stale_acquires.pop_front().unwrap_or(false) {
                return Ok(Acquired::Stale);
            }
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            self.events.push(Event::Acquired { slot, image });
            Ok(Acquired::Image(image))
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            assert_eq!(self.fences[slot], FenceState::Signaled);
            self.fences[slot] = FenceState::Reset;
            Ok(())
        }

        fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
            assert_eq!(self.fences[slot], FenceState::Reset);
            self.fences[slot] = FenceState::Pending;
            self.max_in_flight = self.max_in_flight.max(self.in_flight());
            self.events.push(Event::Submitted { slot, image });
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> Result<Presented> {
            self.events.push(Event::Presented { slot, image });
            if self.stale_presents.pop_front().unwrap_or(false) {
                Ok(Presented::Stale)
            } else {
                Ok(Presented::Done)
            }
        }

        fn rebuild(&mut self) -> Result<()> {
            // Device idle: everything pending completes
            for fence in &mut self.fences {
                assert_ne!(*fence, FenceState::Reset);
                *fence = FenceState::Signaled;
            }
            self.next_image = 0;
            self.events.push(Event::Rebuilt);
            Ok(())
        }
    }

    fn run(frames: usize, sync: &mut FrameSynchronizer, gpu: &mut MockGpu) -> Vec<FrameOutcome> {
        (0..frames).map(|_| sync.draw_frame(gpu).unwrap()).collect()
    }

    #[test]
    fn in_flight_submissions_never_exceed_slot_count() {
        for slots in 1..=3 {
            let mut sync = FrameSynchronizer::new(slots);
            let mut gpu = MockGpu::new(slots, 3);

            run(12, &mut sync, &mut gpu);

            assert_eq!(gpu.max_in_flight, slots);
            assert_eq!(gpu.submissions().len(), 12);
        }
    }

    #[test]
    fn submission_past_slot_count_waits_for_that_slot() {
        let slots = 2;
        let mut sync = FrameSynchronizer::new(slots);
        let mut gpu = MockGpu::new(slots, 3);

        run(6, &mut sync, &mut gpu);

        let submissions = gpu.submissions();
        for (n, &at) in submissions.iter().enumerate().skip(slots) {
            let slot = n % slots;
            let waited = gpu.events[..at]
                .iter()
                .rev()
                .find(|e| matches!(e, Event::Waited { .. }))
                .copied();
            assert_eq!(waited, Some(Event::Waited { slot, blocked: true }));
        }

        // First round never blocks
        assert_eq!(gpu.events[0], Event::Waited { slot: 0, blocked: false });
    }

    #[test]
    fn slots_rotate_independently_of_images() {
        let mut sync = FrameSynchronizer::new(2);
        let mut gpu = MockGpu::new(2, 3);

        let outcomes = run(6, &mut sync, &mut gpu);

        let pairs: Vec<(usize, u32)> = outcomes
            .iter()
            .map(|o| match *o {
                FrameOutcome::Presented { slot, image } => (slot, image),
                FrameOutcome::Rebuilt => panic!("unexpected rebuild"),
            })
            .collect();
        assert_eq!(pairs, vec![(0, 0), (1, 1), (0, 2), (1, 0), (0, 1), (1, 2)]);
    }

    #[test]
    fn finished_frame_returns_to_idle_on_next_slot() {
        let mut sync = FrameSynchronizer::new(2);
        let mut gpu = MockGpu::new(2, 2);

        assert_eq!(sync.state(), FrameState::Idle(0));
        sync.draw_frame(&mut gpu).unwrap();
        assert_eq!(sync.state(), FrameState::Idle(1));
        sync.draw_frame(&mut gpu).unwrap();
        assert_eq!(sync.state(), FrameState::Idle(0));
    }

    #[test]
    fn zero_slots_is_treated_as_one() {
        let mut sync = FrameSynchronizer::new(0);
        let mut gpu = MockGpu::new(1, 2);

        assert_eq!(sync.frames_in_flight(), 1);
        run(3, &mut sync, &mut gpu);
        assert_eq!(gpu.max_in_flight, 1);
    }

    #[test]
    fn stale_acquire_rebuilds_without_drawing() {
        let mut sync = FrameSynchronizer::new(2);
        let mut gpu = MockGpu::new(2, 3);
        gpu.stale_acquires = VecDeque::from([false, true]);

        let outcomes = run(2, &mut sync, &mut gpu);

        assert_eq!(outcomes[1], FrameOutcome::Rebuilt);
        assert_eq!(gpu.submissions().len(), 1);
        assert_eq!(sync.state(), FrameState::Idle(1));
        assert!(!sync.rebuild_pending);

        // Same slot draws next, its fence was never left reset
        assert_eq!(
            sync.draw_frame(&mut gpu).unwrap(),
            FrameOutcome::Presented { slot: 1, image: 0 }
        );
    }

    #[test]
    fn repeated_stale_acquires_never_deadlock() {
        let mut sync = FrameSynchronizer::new(2);
        let mut gpu = MockGpu::new(2, 3);
        gpu.stale_acquires = VecDeque::from([true; 5]);

        let outcomes = run(6, &mut sync, &mut gpu);

        assert!(outcomes[..5].iter().all(|o| *o == FrameOutcome::Rebuilt));
        assert_eq!(outcomes[5], FrameOutcome::Presented { slot: 0, image: 0 });
    }

    #[test]
    fn stale_present_rebuilds_on_next_frame() {
        let mut sync = FrameSynchronizer::new(2);
        let mut gpu = MockGpu::new(2, 3);
        gpu.stale_presents = VecDeque::from([true]);

        let first = sync.draw_frame(&mut gpu).unwrap();
        assert_eq!(first, FrameOutcome::Presented { slot: 0, image: 0 });
        assert!(sync.rebuild_pending);

        let events_before = gpu.events.len();
        assert_eq!(sync.draw_frame(&mut gpu).unwrap(), FrameOutcome::Rebuilt);
        assert_eq!(gpu.events[events_before..], [Event::Rebuilt]);

        assert_eq!(
            sync.draw_frame(&mut gpu).unwrap(),
            FrameOutcome::Presented { slot: 1, image: 0 }
        );
    }

    #[test]
    fn requested_rebuild_happens_before_acquire() {
        let mut sync = FrameSynchronizer::new(2);
        let mut gpu = MockGpu::new(2, 3);

        sync.draw_frame(&mut gpu).unwrap();
        sync.request_rebuild();
        assert_eq!(sync.draw_frame(&mut gpu).unwrap(), FrameOutcome::Rebuilt);

        assert_eq!(gpu.events.last(), Some(&Event::Rebuilt));
        assert_eq!(
            gpu.events
                .iter()
                .filter(|e| matches!(e, Event::Acquired { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn repeated_rebuild_requests_rebuild_once() {
        let mut sync = FrameSynchronizer::new(2);
        let mut gpu = MockGpu::new(2, 3);

        sync.draw_frame(&mut gpu).unwrap();
        sync.request_rebuild();
        sync.request_rebuild();

        assert_eq!(sync.draw_frame(&mut gpu).unwrap(), FrameOutcome::Rebuilt);
        assert_eq!(gpu.rebuilds(), 1);
        assert!(gpu.all_fences_signaled());
        assert_eq!(sync.state(), FrameState::Idle(1));

        assert_eq!(
            sync.draw_frame(&mut gpu).unwrap(),
            FrameOutcome::Presented { slot: 1, image: 0 }
        );
        assert_eq!(gpu.rebuilds(), 1);
    }

    #[test]
    fn consecutive_rebuilds_keep_slot_and_fences_intact() {
        let mut sync = FrameSynchronizer::new(2);
        let mut gpu = MockGpu::new(2, 3);
        gpu.stale_acquires = VecDeque::from([true]);

        sync.request_rebuild();
        assert_eq!(sync.draw_frame(&mut gpu).unwrap(), FrameOutcome::Rebuilt);
        assert_eq!(sync.draw_frame(&mut gpu).unwrap(), FrameOutcome::Rebuilt);
        sync.request_rebuild();
        assert_eq!(sync.draw_frame(&mut gpu).unwrap(), FrameOutcome::Rebuilt);

        // One rebuild per iteration, nothing submitted, slot never advanced
        assert_eq!(gpu.rebuilds(), 3);
        assert!(gpu.submissions().is_empty());
        assert!(gpu.all_fences_signaled());
        assert_eq!(sync.state(), FrameState::Idle(0));

        assert_eq!(
            sync.draw_frame(&mut gpu).unwrap(),
            FrameOutcome::Presented { slot: 0, image: 0 }
        );
    }
}
