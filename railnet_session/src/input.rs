// Edge sampling of cab controls.
//
// The game reports which control keys are currently held. Each tick the
// sampler compares that with the previous sample and turns edges into
// discrete events: horn and bell report their new on/off state on every
// change, while wiper, pantograph and headlight advance a counter on each
// press (modulo 2, 2 and 3 respectively) and report the new counter value.

use railnet_protocol::EventKind;

/// Keys held down at one sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputState {
    pub horn: bool,
    pub bell: bool,
    pub wiper: bool,
    pub pantograph: bool,
    pub headlight: bool,
}

#[derive(Debug, Default)]
pub struct EdgeSampler {
    previous: InputState,
    wiper: u8,
    pantograph: u8,
    headlight: u8,
}

impl EdgeSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events caused by the change from the previous sample to `input`.
    pub fn sample(&mut self, input: InputState) -> Vec<(EventKind, u8)> {
        let previous = std::mem::replace(&mut self.previous, input);
        let mut events = Vec::new();

        if input.horn != previous.horn {
            events.push((EventKind::Horn, u8::from(input.horn)));
        }
        if input.bell != previous.bell {
            events.push((EventKind::Bell, u8::from(input.bell)));
        }
        if input.wiper && !previous.wiper {
            self.wiper = advance(self.wiper, EventKind::Wiper);
            events.push((EventKind::Wiper, self.wiper));
        }
        if input.pantograph && !previous.pantograph {
            self.pantograph = advance(self.pantograph, EventKind::Pantograph);
            events.push((EventKind::Pantograph, self.pantograph));
        }
        if input.headlight && !previous.headlight {
            self.headlight = advance(self.headlight, EventKind::Headlight);
            events.push((EventKind::Headlight, self.headlight));
        }
        events
    }
}

fn advance(counter: u8, kind: EventKind) -> u8 {
    (counter + 1) % kind.state_count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horn_reports_both_edges() {
        let mut sampler = EdgeSampler::new();
        let held = InputState {
            horn: true,
            ..InputState::default()
        };
        assert_eq!(sampler.sample(held), vec![(EventKind::Horn, 1)]);
        assert!(sampler.sample(held).is_empty());
        assert_eq!(
            sampler.sample(InputState::default()),
            vec![(EventKind::Horn, 0)]
        );
    }

    #[test]
    fn headlight_cycles_through_three_states() {
        let mut sampler = EdgeSampler::new();
        let pressed = InputState {
            headlight: true,
            ..InputState::default()
        };
        let mut states = Vec::new();
        for _ in 0..4 {
            states.extend(sampler.sample(pressed).into_iter().map(|(_, s)| s));
            sampler.sample(InputState::default());
        }
        assert_eq!(states, vec![1, 2, 0, 1]);
    }

    #[test]
    fn wiper_and_pantograph_toggle_on_press_only() {
        let mut sampler = EdgeSampler::new();
        let pressed = InputState {
            wiper: true,
            pantograph: true,
            ..InputState::default()
        };
        assert_eq!(
            sampler.sample(pressed),
            vec![(EventKind::Wiper, 1), (EventKind::Pantograph, 1)]
        );
        // Holding does nothing, releasing does nothing.
        assert!(sampler.sample(pressed).is_empty());
        assert!(sampler.sample(InputState::default()).is_empty());
        assert_eq!(
            sampler.sample(pressed),
            vec![(EventKind::Wiper, 0), (EventKind::Pantograph, 0)]
        );
    }
}
