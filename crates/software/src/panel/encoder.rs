/// Quadrature transitions indexed by `previous << 2 | current`, where each state is `clk << 1 | dt`.
const TRANSITIONS: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

/// Valid transitions per detent.
const STEPS_PER_DETENT: i8 = 4;

/// Decodes a detented quadrature encoder into a position clamped to `-limit..=limit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OctaveEncoder {
    limit: i8,
    position: i8,
    state: u8,
    steps: i8,
}

impl OctaveEncoder {
    /// Creates an encoder at position 0 with both pins idle (high).
    pub fn new(limit: i8) -> Self {
        Self {
            limit,
            position: 0,
            state: 0b11,
            steps: 0,
        }
    }

    /// Returns the clamped position.
    pub fn position(&self) -> i8 {
        self.position
    }

    /// Feeds the current pin levels. Returns the new position when a detent moved it.
    pub fn update(&mut self, clk: bool, dt: bool) -> Option<i8> {
        let current = (u8::from(clk) << 1) | u8::from(dt);
        if current == self.state {
            return None;
        }
        self.steps += TRANSITIONS[usize::from((self.state << 2) | current)];
        self.state = current;

        let direction = match self.steps {
            s if s >= STEPS_PER_DETENT => 1,
            s if s <= -STEPS_PER_DETENT => -1,
            _ => return None,
        };
        self.steps = 0;

        let position = (self.position + direction).clamp(-self.limit, self.limit);
        if position == self.position {
            return None;
        }
        debug!("Encoder position {}", position);
        self.position = position;
        Some(position)
    }

    /// Returns to position 0.
    pub fn reset(&mut self) {
        self.position = 0;
        self.steps = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCKWISE: [(bool, bool); 4] = [(false, true), (false, false), (true, false), (true, true)];
    const COUNTER_CLOCKWISE: [(bool, bool); 4] = [(true, false), (false, false), (false, true), (true, true)];

    fn turn(encoder: &mut OctaveEncoder, sequence: [(bool, bool); 4]) -> Option<i8> {
        sequence
            .into_iter()
            .map(|(clk, dt)| encoder.update(clk, dt))
            .fold(None, |last, result| result.or(last))
    }

    #[test]
    fn detents_move_position() {
        let mut encoder = OctaveEncoder::new(3);
        assert_eq!(Some(1), turn(&mut encoder, CLOCKWISE), "Expected left but got right");
        assert_eq!(Some(2), turn(&mut encoder, CLOCKWISE), "Expected left but got right");
        assert_eq!(Some(1), turn(&mut encoder, COUNTER_CLOCKWISE), "Expected left but got right");
    }

    #[test]
    fn position_is_clamped() {
        let mut encoder = OctaveEncoder::new(3);
        for _ in 0..5 {
            turn(&mut encoder, COUNTER_CLOCKWISE);
        }
        assert_eq!(-3, encoder.position(), "Expected left but got right");
        assert_eq!(
            Some(-2),
            turn(&mut encoder, CLOCKWISE),
            "Turning back should move immediately; expected left but got right"
        );
    }

    #[test]
    fn bounce_does_not_move() {
        let mut encoder = OctaveEncoder::new(3);
        encoder.update(false, true);
        encoder.update(true, true);
        encoder.update(false, true);
        encoder.update(true, true);
        assert_eq!(0, encoder.position(), "Expected left but got right");
    }
}
