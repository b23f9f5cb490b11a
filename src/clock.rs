/// Lamport logical clock. Advances on every send and on every receive,
/// giving a causal order over protocol events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self { time: 0 }
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    /// Increment for a local send event; returns the new time.
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Fold in a received timestamp: max(local, remote) + 1.
    pub fn update(&mut self, remote: u64) -> u64 {
        self.time = self.time.max(remote) + 1;
        self.time
    }
}
