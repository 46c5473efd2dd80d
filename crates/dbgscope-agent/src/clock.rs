use std::num::NonZeroU32;

/// Converts raw performance-counter values into seconds.
///
/// The first converted value becomes the origin, so a session's first record
/// resolves to `0.0` and later records are relative to it.
#[derive(Clone, Debug)]
pub struct ClockConverter {
    frequency: NonZeroU32,
    origin: Option<i64>,
}

impl ClockConverter {
    /// Create a converter for a counter ticking `frequency` times per second
    pub fn new(frequency: NonZeroU32) -> Self {
        Self {
            frequency,
            origin: None,
        }
    }

    /// Ticks per second
    pub fn frequency(&self) -> u32 {
        self.frequency.get()
    }

    /// Seconds elapsed between the origin and `counter`
    pub fn get(&mut self, counter: i64) -> f64 {
        let origin = *self.origin.get_or_insert(counter);
        let ticks = i128::from(counter) - i128::from(origin);
        ticks as f64 / f64::from(self.frequency.get())
    }

    /// Forget the origin; the next converted value becomes `0.0`
    pub fn reset(&mut self) {
        self.origin = None;
    }
}
