/// Full-speed USB bit rate.
pub const USB_HZ: u64 = 12_000_000;

/// Nominal USB frame period.
pub const FRAME_PERIOD_NS: u64 = 1_000_000;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Frame timer in guest virtual time.
///
/// The timer is either disarmed (bus stopped) or armed with the deadline of the next frame
/// boundary. `sof_time_ns` is the guest time of the most recent start-of-frame and is the
/// reference `HcFmRemaining` counts down from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimer {
    period_ns: u64,
    deadline_ns: Option<u64>,
    sof_time_ns: u64,
}

impl FrameTimer {
    pub fn new(period_ns: u64) -> Self {
        Self {
            period_ns: period_ns.max(1),
            deadline_ns: None,
            sof_time_ns: 0,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_ns.is_some()
    }

    pub fn deadline_ns(&self) -> Option<u64> {
        self.deadline_ns
    }

    /// Arms the timer and records a start-of-frame at `now_ns`.
    pub fn start(&mut self, now_ns: u64) {
        self.start_of_frame(now_ns);
    }

    /// Disarms the timer. Stopping a stopped timer is a no-op.
    pub fn stop(&mut self) {
        self.deadline_ns = None;
    }

    /// Returns the boundary time of the frame that is due at `now_ns`, if any.
    pub fn due(&self, now_ns: u64) -> Option<u64> {
        self.deadline_ns.filter(|&deadline| deadline <= now_ns)
    }

    /// Records a start-of-frame at `boundary_ns` and schedules the next boundary.
    pub fn start_of_frame(&mut self, boundary_ns: u64) {
        self.sof_time_ns = boundary_ns;
        self.deadline_ns = Some(boundary_ns.saturating_add(self.period_ns));
    }

    /// Drops any backlog of missed frames: the next boundary is one period after `now_ns`.
    pub fn resync(&mut self, now_ns: u64) {
        if self.deadline_ns.is_some() {
            self.deadline_ns = Some(now_ns.saturating_add(self.period_ns));
        }
    }

    /// 12 MHz bit times elapsed since the last start-of-frame, or `None` once a full frame period
    /// has passed.
    pub fn bit_times_since_sof(&self, now_ns: u64) -> Option<u64> {
        let elapsed = now_ns.saturating_sub(self.sof_time_ns);
        if elapsed >= self.period_ns {
            return None;
        }
        let ticks = (u128::from(elapsed) * u128::from(USB_HZ)) / NANOS_PER_SEC;
        Some(ticks as u64)
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(FRAME_PERIOD_NS)
    }
}
