use std::time::Duration;
use tokio::time::Instant;

/// Spaces writes evenly at a fixed requests-per-second rate.
///
/// Slots are handed out back to back even when the connection falls behind,
/// so a stalled connection catches up instead of silently dropping load.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    next: Option<Instant>,
}

impl Pacer {
    pub fn per_second(rate: u64) -> Self {
        Self {
            interval: Duration::from_secs(1) / rate.clamp(1, u32::MAX as u64) as u32,
            next: None,
        }
    }

    /// When the next write may go out.
    pub fn next_slot(&self) -> Option<Instant> {
        self.next
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.next.is_none_or(|next| next <= now)
    }

    /// Claims the current slot and schedules the following one.
    pub fn advance(&mut self, now: Instant) {
        let scheduled = self.next.unwrap_or(now);
        self.next = Some(scheduled + self.interval);
    }

    /// Forgets the schedule; the next write may go out at once.
    pub fn restart(&mut self) {
        self.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaces_slots_by_the_interval() {
        let mut pacer = Pacer::per_second(4);
        assert_eq!(pacer.interval, Duration::from_millis(250));

        let start = Instant::now();
        assert!(pacer.is_ready(start));
        pacer.advance(start);
        assert!(!pacer.is_ready(start));
        assert_eq!(pacer.next_slot(), Some(start + Duration::from_millis(250)));

        // late writes keep the original schedule
        let late = start + Duration::from_secs(1);
        assert!(pacer.is_ready(late));
        pacer.advance(late);
        assert_eq!(pacer.next_slot(), Some(start + Duration::from_millis(500)));

        pacer.restart();
        assert!(pacer.is_ready(start));
    }
}
