//! Magnet-sensor homing
//!
//! A hand has no absolute encoder; its only reference is a magnet sensor
//! that triggers once per revolution. Homing runs at power-up and after a
//! hot reset:
//!
//! 1. coarse seek: rotate at search speed until the sensor triggers
//! 2. back off a fixed sixth of a revolution
//! 3. fine seek: approach again at a third of the search speed, so the
//!    trigger edge lands on a consistent flank
//! 4. travel to the calibrated initial tick
//!
//! The sensor is debounced: two consecutive triggered samples are required
//! before the rotor position is zeroed (see
//! [`RampedStepper::magnet_debounced`]).

use embedded_hal::digital::{InputPin, OutputPin};

use super::motor::RampedStepper;

/// Search speed for the coarse seek, rpm
pub const SEARCH_RPM: i16 = 24;

/// Where the homing sequence currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HomingState {
    /// Fast rotation toward the first trigger
    CoarseSeek,
    /// Stepping back out of the trigger zone
    Backoff { left: u16 },
    /// Slow approach for the precise trigger edge
    FineSeek,
    /// Trigger confirmed; moving to the calibrated initial tick
    OffsetSeek,
    Done,
}

/// Homing state machine for one motor
#[derive(Debug, Clone)]
pub struct HomingSequence {
    state: HomingState,
    initial_ticks: i16,
}

impl HomingSequence {
    pub const fn new(initial_ticks: i16) -> Self {
        Self {
            state: HomingState::Done,
            initial_ticks,
        }
    }

    /// Update the park position; returns true if it changed
    pub fn set_initial_ticks(&mut self, value: i16) -> bool {
        if self.initial_ticks == value {
            return false;
        }
        self.initial_ticks = value;
        true
    }

    pub fn state(&self) -> HomingState {
        self.state
    }

    pub fn busy(&self) -> bool {
        self.state != HomingState::Done
    }

    /// Start (or restart) the sequence
    pub fn begin<S, D, Z>(&mut self, stepper: &mut RampedStepper<S, D, Z>, now_us: u64)
    where
        S: OutputPin,
        D: OutputPin,
        Z: InputPin,
    {
        self.state = HomingState::CoarseSeek;
        stepper.set_ghost(false);
        // Always approach from the same side so the stop lands consistently
        stepper.assume_speed_rpm(SEARCH_RPM);
        stepper.set_speed_rpm(SEARCH_RPM);
        stepper.sync(now_us);
    }

    /// Advance the sequence; call every scheduler tick until `Done`
    pub fn poll<S, D, Z>(
        &mut self,
        stepper: &mut RampedStepper<S, D, Z>,
        now_us: u64,
    ) -> HomingState
    where
        S: OutputPin,
        D: OutputPin,
        Z: InputPin,
    {
        match self.state {
            HomingState::CoarseSeek => {
                if stepper.magnet_debounced() {
                    stepper.zero_here();
                    self.state = HomingState::Backoff {
                        left: stepper.ring().size() / 6,
                    };
                    stepper.assume_speed_rpm(-SEARCH_RPM / 3);
                    stepper.set_speed_rpm(-SEARCH_RPM / 3);
                    stepper.sync(now_us);
                } else {
                    stepper.try_step(now_us);
                }
            }

            HomingState::Backoff { left } => {
                if stepper.try_step(now_us) {
                    if left <= 1 {
                        self.state = HomingState::FineSeek;
                        stepper.assume_speed_rpm(SEARCH_RPM / 3);
                        stepper.set_speed_rpm(SEARCH_RPM / 3);
                        stepper.sync(now_us);
                    } else {
                        self.state = HomingState::Backoff { left: left - 1 };
                    }
                }
            }

            HomingState::FineSeek => {
                if stepper.magnet_debounced() {
                    stepper.zero_here();
                    self.state = HomingState::OffsetSeek;
                    stepper.assume_speed_rpm(-SEARCH_RPM);
                    stepper.set_speed_rpm(-SEARCH_RPM);
                    stepper.sync(now_us);
                } else {
                    stepper.try_step(now_us);
                }
            }

            HomingState::OffsetSeek => {
                let target = stepper.ring().normalize(self.initial_ticks as i32);
                if stepper.ticks() == target {
                    stepper.set_speed_rpm(0);
                    self.state = HomingState::Done;
                } else {
                    stepper.try_step(now_us);
                }
            }

            HomingState::Done => {}
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnomon_core::ticks::RING;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct MockPin {
        high: Rc<Cell<bool>>,
        edges: Rc<Cell<u32>>,
    }

    impl embedded_hal::digital::ErrorType for MockPin {
        type Error = core::convert::Infallible;
    }

    impl embedded_hal::digital::OutputPin for MockPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.high.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            if !self.high.get() {
                self.edges.set(self.edges.get() + 1);
            }
            self.high.set(true);
            Ok(())
        }
    }

    impl embedded_hal::digital::InputPin for MockPin {
        fn is_high(&mut self) -> Result<bool, Self::Error> {
            Ok(self.high.get())
        }

        fn is_low(&mut self) -> Result<bool, Self::Error> {
            Ok(!self.high.get())
        }
    }

    /// Simulated motor + magnet: the magnet sits at physical tick 0 with a
    /// small trigger zone; the rotor starts at an arbitrary physical angle.
    struct Rig {
        stepper: RampedStepper<MockPin, MockPin, MockPin>,
        step_pin: MockPin,
        dir_pin: MockPin,
        sense_pin: MockPin,
        physical: i32,
        prev_edges: u32,
    }

    impl Rig {
        fn new(start_physical: i32) -> Self {
            let step_pin = MockPin::default();
            let dir_pin = MockPin::default();
            let sense_pin = MockPin::default();
            sense_pin.high.set(true); // not triggered
            let stepper =
                RampedStepper::new(step_pin.clone(), dir_pin.clone(), sense_pin.clone(), RING);
            Self {
                stepper,
                step_pin,
                dir_pin,
                sense_pin,
                physical: start_physical,
                prev_edges: 0,
            }
        }

        /// Track physical rotation from the step/dir pins and refresh the
        /// magnet sensor accordingly
        fn update_world(&mut self) {
            let edges = self.step_pin.edges.get();
            let delta = (edges - self.prev_edges) as i32;
            self.prev_edges = edges;
            // dir pin high = anticlockwise
            self.physical += if self.dir_pin.high.get() { -delta } else { delta };
            let pos = RING.normalize(self.physical);
            let in_zone = pos <= 2 || pos >= 718;
            self.sense_pin.high.set(!in_zone); // active low
        }

        fn run(&mut self, homing: &mut HomingSequence) -> u64 {
            let mut now = 0u64;
            homing.begin(&mut self.stepper, now);
            self.update_world();
            while homing.busy() {
                now += 40;
                assert!(now < 600_000_000, "homing never finished");
                homing.poll(&mut self.stepper, now);
                self.update_world();
            }
            now
        }
    }

    #[test]
    fn test_homing_lands_on_initial_ticks() {
        let mut rig = Rig::new(500);
        let mut homing = HomingSequence::new(360);
        rig.run(&mut homing);

        assert_eq!(homing.state(), HomingState::Done);
        let ticks = rig.stepper.ticks() as i32;
        assert!((ticks - 360).abs() <= 3, "ticks={}", ticks);
        // The displayed position tracks the physical one: the magnet zone
        // became tick zero
        let physical = RING.normalize(rig.physical) as i32;
        assert!((physical - 360).abs() <= 5, "physical={}", physical);
    }

    #[test]
    fn test_homing_from_inside_trigger_zone() {
        // Rotor powered up sitting on the magnet
        let mut rig = Rig::new(0);
        let mut homing = HomingSequence::new(0);
        rig.run(&mut homing);
        assert_eq!(homing.state(), HomingState::Done);
        let ticks = rig.stepper.ticks();
        assert!(ticks <= 3 || ticks >= 717, "ticks={}", ticks);
    }

    #[test]
    fn test_single_spurious_sample_does_not_zero() {
        let mut rig = Rig::new(300);
        let mut homing = HomingSequence::new(0);
        let mut now = 0u64;
        homing.begin(&mut rig.stepper, now);

        // One noise spike on the sensor, then clean again
        rig.sense_pin.high.set(false);
        now += 40;
        homing.poll(&mut rig.stepper, now);
        rig.sense_pin.high.set(true);
        now += 40;
        homing.poll(&mut rig.stepper, now);

        assert_eq!(homing.state(), HomingState::CoarseSeek);
    }

    #[test]
    fn test_set_initial_ticks_change_detection() {
        let mut homing = HomingSequence::new(0);
        assert!(homing.set_initial_ticks(360));
        assert!(!homing.set_initial_ticks(360));
    }
}
