use crate::parser::RegisterSnapshot;
use std::collections::BTreeSet;
use tracing::info;

/// Decides whether a replay loop stops at a snapshot.
pub trait BreakpointPredicate {
    fn matches(&self, snapshot: &RegisterSnapshot) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct Breakpoints {
    points: BTreeSet<u16>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: u16) {
        self.points.insert(address);
        info!("Breakpoint set at {:04X}h", address);
    }

    pub fn remove(&mut self, address: u16) {
        self.points.remove(&address);
        info!("Breakpoint removed from {:04X}h", address);
    }

    pub fn contains(&self, address: u16) -> bool {
        self.points.contains(&address)
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn addresses(&self) -> Vec<u16> {
        self.points.iter().copied().collect()
    }
}

impl BreakpointPredicate for Breakpoints {
    fn matches(&self, snapshot: &RegisterSnapshot) -> bool {
        self.contains(snapshot.pc)
    }
}
