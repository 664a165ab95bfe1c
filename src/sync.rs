//! Interrupt-level control for the cooperative scheduling model.
//!
//! The simulator is single-threaded and cooperative: nothing runs in
//! parallel, but the enclosing scheduler may preempt between simulated
//! ticks. Multi-step updates of the frame table are bracketed by an
//! interrupt-disable scope so they are observed as one atomic step.

use std::cell::Cell;
use std::rc::Rc;

/// 模拟的中断开关只有开和关两档，和调度器共享同一个状态
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IntrLevel {
    Off,
    On,
}

/// Shared handle to the machine's interrupt enable state.
///
/// Handles are cheap clones of one underlying cell, so a guard can own a
/// handle without borrowing the kernel it came from.
#[derive(Clone)]
pub struct Interrupt {
    level: Rc<Cell<IntrLevel>>,
}

impl Interrupt {
    /// Interrupts start enabled.
    pub fn new() -> Self {
        Self {
            level: Rc::new(Cell::new(IntrLevel::On)),
        }
    }

    /// Set the interrupt level, returning the previous one.
    pub fn set_level(&self, level: IntrLevel) -> IntrLevel {
        self.level.replace(level)
    }

    pub fn level(&self) -> IntrLevel {
        self.level.get()
    }

    /// Disable interrupts for the lifetime of the returned guard; the prior
    /// level is restored when the guard drops, on every exit path.
    #[must_use = "interrupts are re-enabled as soon as the guard drops"]
    pub fn disable(&self) -> IntrGuard {
        let old = self.set_level(IntrLevel::Off);
        IntrGuard {
            intr: self.clone(),
            old,
        }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII scope created by [`Interrupt::disable`].
pub struct IntrGuard {
    intr: Interrupt,
    old: IntrLevel,
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        self.intr.set_level(self.old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_prior_level() {
        let intr = Interrupt::new();
        assert_eq!(intr.level(), IntrLevel::On);
        {
            let _g = intr.disable();
            assert_eq!(intr.level(), IntrLevel::Off);
        }
        assert_eq!(intr.level(), IntrLevel::On);
    }

    #[test]
    fn nested_guards_unwind_in_order() {
        let intr = Interrupt::new();
        let g1 = intr.disable();
        {
            let _g2 = intr.disable();
            assert_eq!(intr.level(), IntrLevel::Off);
        }
        // still off: the outer scope disabled first
        assert_eq!(intr.level(), IntrLevel::Off);
        drop(g1);
        assert_eq!(intr.level(), IntrLevel::On);
    }
}
