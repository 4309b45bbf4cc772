/*!
Scalar state cells with reset semantics.

A `Register` carries a value across cycles and is reset by policy: hold the
current value, load a constant, or go high-Z (modeled as the type's default
with a `driven` flag cleared). A `Signal` is a register that additionally
logs its transitions, standing in for a waveform-traced net.

Ownership: each register belongs to exactly one component; only that
component mutates it. Reset sequencing is centralized in the owning
component's `reset()`.
*/

use std::ops::{Add, Sub};

/// Reset policy of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind<T> {
    /// Keep whatever value the register holds.
    Hold,
    /// Load a constant on reset.
    Constant(T),
    /// Undriven after reset until the first `set`.
    HighZ,
}

/// Value cell surviving across cycles, reset by policy.
#[derive(Debug, Clone)]
pub struct Register<T> {
    value: T,
    reset: ResetKind<T>,
    driven: bool,
}

impl<T: Copy + Default> Register<T> {
    pub fn new(reset: ResetKind<T>) -> Self {
        let (value, driven) = match reset {
            ResetKind::Hold => (T::default(), true),
            ResetKind::Constant(v) => (v, true),
            ResetKind::HighZ => (T::default(), false),
        };
        Self {
            value,
            reset,
            driven,
        }
    }

    /// Register resetting to a constant value.
    pub fn with_reset(value: T) -> Self {
        Self::new(ResetKind::Constant(value))
    }

    #[inline]
    pub fn get(&self) -> T {
        self.value
    }

    #[inline]
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.driven = true;
    }

    /// Whether the cell is currently driven (false only after a high-Z
    /// reset with no set since).
    #[inline]
    pub fn is_driven(&self) -> bool {
        self.driven
    }

    /// Apply the reset policy.
    pub fn reset(&mut self) {
        match self.reset {
            ResetKind::Hold => {}
            ResetKind::Constant(v) => {
                self.value = v;
                self.driven = true;
            }
            ResetKind::HighZ => {
                self.value = T::default();
                self.driven = false;
            }
        }
    }
}

impl<T: Copy + Default + Add<Output = T>> Register<T> {
    #[inline]
    pub fn inc(&mut self, by: T) {
        self.value = self.value + by;
        self.driven = true;
    }
}

impl<T: Copy + Default + Sub<Output = T>> Register<T> {
    #[inline]
    pub fn dec(&mut self, by: T) {
        self.value = self.value - by;
        self.driven = true;
    }
}

impl<T: Copy + Default> Default for Register<T> {
    fn default() -> Self {
        Self::new(ResetKind::Constant(T::default()))
    }
}

/// Register that logs transitions under the owning component's name.
#[derive(Debug, Clone)]
pub struct Signal<T> {
    reg: Register<T>,
    name: &'static str,
}

impl<T: Copy + Default + PartialEq + std::fmt::Debug> Signal<T> {
    pub fn new(name: &'static str, reset: ResetKind<T>) -> Self {
        Self {
            reg: Register::new(reset),
            name,
        }
    }

    #[inline]
    pub fn get(&self) -> T {
        self.reg.get()
    }

    pub fn set(&mut self, value: T) {
        if self.reg.get() != value || !self.reg.is_driven() {
            log::trace!("signal {} <- {:?}", self.name, value);
        }
        self.reg.set(value);
    }

    /// Pulse: drive a value for observation, then return to default.
    /// Used for one-cycle strobes.
    pub fn set_and_release(&mut self, value: T) {
        self.set(value);
        self.reg.set(T::default());
    }

    pub fn reset(&mut self) {
        self.reg.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_reset_reloads_value() {
        let mut r: Register<u32> = Register::new(ResetKind::Constant(7));
        assert_eq!(r.get(), 7);
        r.set(99);
        r.reset();
        assert_eq!(r.get(), 7);
    }

    #[test]
    fn hold_reset_keeps_value() {
        let mut r: Register<u32> = Register::new(ResetKind::Hold);
        r.set(5);
        r.reset();
        assert_eq!(r.get(), 5);
    }

    #[test]
    fn highz_reset_undrives() {
        let mut r: Register<u32> = Register::new(ResetKind::HighZ);
        r.set(5);
        assert!(r.is_driven());
        r.reset();
        assert!(!r.is_driven());
        assert_eq!(r.get(), 0);
    }

    #[test]
    fn inc_dec() {
        let mut r: Register<u32> = Register::with_reset(1);
        r.inc(2);
        assert_eq!(r.get(), 3);
        r.dec(1);
        assert_eq!(r.get(), 2);
    }
}
