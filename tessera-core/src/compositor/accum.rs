//! Sub-pixel accumulation buffer.
//!
//! Each sub-pixel group is composited onto the target, then added here
//! weighted by `1 / total_steps`. `display` writes the running average
//! back, rescaled by how many steps actually arrived.

use super::canvas::CompositeTarget;
use crate::error::TesseraError;
use crate::types::Viewport;

#[derive(Debug, Clone)]
pub struct Accumulator {
    viewport: Viewport,
    sum: Vec<f32>,
    total_steps: u32,
    steps: u32,
}

impl Accumulator {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            sum: vec![0.0; viewport.area() * 4],
            total_steps: 1,
            steps: 0,
        }
    }

    pub fn set_total_steps(&mut self, total: u32) {
        self.total_steps = total.max(1);
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    /// Steps accumulated since the last clear.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Zero the sum, resizing to `viewport` when it changed.
    pub fn resize(&mut self, viewport: Viewport) {
        if viewport != self.viewport {
            self.viewport = viewport;
            self.sum = vec![0.0; viewport.area() * 4];
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        self.sum.fill(0.0);
        self.steps = 0;
    }

    /// Add the target's current color.
    pub fn accum(&mut self, target: &dyn CompositeTarget) -> Result<(), TesseraError> {
        let color = target.color();
        self.check(color.len())?;
        let weight = 1.0 / self.total_steps as f32;
        for (sum, c) in self.sum.iter_mut().zip(color) {
            *sum += *c as f32 * weight;
        }
        self.steps += 1;
        Ok(())
    }

    /// Write the average of the accumulated steps into the target.
    pub fn display(&self, target: &mut dyn CompositeTarget) -> Result<(), TesseraError> {
        if self.steps == 0 {
            return Ok(());
        }
        let color = target.color_mut();
        self.check(color.len())?;
        let scale = self.total_steps as f32 / self.steps as f32;
        for (c, sum) in color.iter_mut().zip(&self.sum) {
            *c = (sum * scale).round().clamp(0.0, 255.0) as u8;
        }
        Ok(())
    }

    fn check(&self, len: usize) -> Result<(), TesseraError> {
        if len != self.sum.len() {
            return Err(TesseraError::InvalidPacketLength {
                expected: self.sum.len(),
                actual: len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::canvas::Canvas;

    #[test]
    fn display_averages_arrived_steps() {
        let vp = Viewport::new(0, 0, 1, 1);
        let mut canvas = Canvas::new(vp);
        let mut accum = Accumulator::new(vp);
        accum.set_total_steps(4);

        for value in [100u8, 200] {
            canvas.color_mut().copy_from_slice(&[value, 0, 0, 255]);
            accum.accum(&canvas).unwrap();
        }
        accum.display(&mut canvas).unwrap();
        assert_eq!(canvas.color_at(0, 0), Some([150, 0, 0, 255]));
        assert_eq!(accum.steps(), 2);
    }

    #[test]
    fn size_mismatch_is_reported() {
        let mut accum = Accumulator::new(Viewport::new(0, 0, 2, 2));
        let canvas = Canvas::new(Viewport::new(0, 0, 1, 1));
        assert!(accum.accum(&canvas).is_err());
    }
}
