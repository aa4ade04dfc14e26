//! The trigger line consumed by the oscilloscope.

use std::time::{ Duration, Instant };

/// A digital output which frames each leak attempt.
///
/// Implementations must not fail at runtime: a trigger which can't be driven
/// is a startup error.
pub trait Trigger {
    fn assert(&mut self);
    fn deassert(&mut self);

    /// Width of the most recent completed pulse, when the implementation can
    /// observe it.
    fn last_pulse(&self) -> Option<Duration> { None }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level { High, Low }

/// A single transition of the trigger line.
#[derive(Clone, Copy, Debug)]
pub struct Edge {
    pub level: Level,
    pub at: Instant,
}

/// An in-memory [`Trigger`] which records recent edges.
///
/// Driving the line to the level it already has is not an edge, which
/// matches what the scope sees on a real pin. Only the most recent
/// `history` edges are kept; the width of the last pulse is tracked
/// separately so it survives trimming.
#[derive(Clone, Debug)]
pub struct PulseRecorder {
    level: Level,
    edges: Vec<Edge>,
    history: usize,
    last_rise: Option<Instant>,
    last_pulse: Option<Duration>,
}

impl PulseRecorder {
    /// Default number of retained edges.
    pub const HISTORY: usize = 4096;

    pub fn new() -> Self { Self::with_history(Self::HISTORY) }

    /// Keep at most `history` edges (at least two).
    pub fn with_history(history: usize) -> Self {
        Self {
            level: Level::Low,
            edges: Vec::new(),
            history: history.max(2),
            last_rise: None,
            last_pulse: None,
        }
    }

    pub fn level(&self) -> Level { self.level }

    pub fn edges(&self) -> &[Edge] { &self.edges }

    pub fn clear(&mut self) { self.edges.clear(); }

    /// Number of rising edges in the retained history.
    pub fn rising_edges(&self) -> usize {
        self.edges.iter().filter(|e| e.level == Level::High).count()
    }

    /// Widths of the completed pulses in the retained history, in order.
    pub fn pulses(&self) -> Vec<Duration> {
        let mut res = Vec::new();
        let mut rise: Option<Instant> = None;
        for e in &self.edges {
            match e.level {
                Level::High => rise = Some(e.at),
                Level::Low => if let Some(r) = rise.take() {
                    res.push(e.at.duration_since(r));
                },
            }
        }
        res
    }

    fn drive(&mut self, level: Level) {
        if self.level == level {
            return;
        }
        let at = Instant::now();
        self.level = level;
        match level {
            Level::High => self.last_rise = Some(at),
            Level::Low => if let Some(r) = self.last_rise.take() {
                self.last_pulse = Some(at.duration_since(r));
            },
        }
        if self.edges.len() >= self.history {
            // Drop an even number of edges so that the history still starts
            // on the same level.
            let drop = (self.history / 2) & !1;
            self.edges.drain(..drop.max(2));
        }
        self.edges.push(Edge { level, at });
    }
}

impl Default for PulseRecorder {
    fn default() -> Self { Self::new() }
}

impl Trigger for PulseRecorder {
    fn assert(&mut self) { self.drive(Level::High) }
    fn deassert(&mut self) { self.drive(Level::Low) }
    fn last_pulse(&self) -> Option<Duration> { self.last_pulse }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_pulses() {
        let mut t = PulseRecorder::new();
        t.deassert();
        assert!(t.edges().is_empty());

        t.assert();
        t.assert();
        std::thread::sleep(Duration::from_millis(2));
        t.deassert();
        t.assert();
        t.deassert();

        assert_eq!(t.edges().len(), 4);
        assert_eq!(t.rising_edges(), 2);
        let p = t.pulses();
        assert_eq!(p.len(), 2);
        assert!(p[0] >= Duration::from_millis(2));
        assert_eq!(t.last_pulse(), Some(p[1]));
        assert_eq!(t.level(), Level::Low);
    }

    #[test]
    fn open_pulse_is_not_counted() {
        let mut t = PulseRecorder::new();
        t.assert();
        assert!(t.pulses().is_empty());
        assert_eq!(t.last_pulse(), None);
        assert_eq!(t.level(), Level::High);
    }

    #[test]
    fn history_is_bounded() {
        let mut t = PulseRecorder::with_history(8);
        for _ in 0..1000 {
            t.assert();
            t.deassert();
        }
        assert!(t.edges().len() <= 8);
        assert_eq!(t.edges()[0].level, Level::High);
        assert_eq!(t.rising_edges(), t.pulses().len());

        t.assert();
        std::thread::sleep(Duration::from_millis(2));
        t.deassert();
        assert!(t.edges().len() <= 8);
        assert!(t.last_pulse().unwrap() >= Duration::from_millis(2));
        assert_eq!(t.last_pulse(), t.pulses().last().copied());
    }
}
