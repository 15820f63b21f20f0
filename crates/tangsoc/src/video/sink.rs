//! Display sink: turns the output video stream back into frames.

use super::{PixelSample, Rgb};
use tracing::{debug, trace};

/// Reassembles frames from the output stream.
///
/// Always ready. Pixels are stored while data-enable is high, a falling data-enable
/// moves to the next line and a rising vsync completes the frame.
#[derive(Debug, Clone)]
pub struct DisplaySink {
    width: usize,
    height: usize,
    framebuffer: Vec<u32>,
    x: usize,
    y: usize,
    prev_de: bool,
    prev_vsync: bool,
    frames: u64,
    capture: Option<(usize, Vec<Vec<u32>>)>,
}

impl DisplaySink {
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = (width as usize, height as usize);
        Self {
            width,
            height,
            framebuffer: vec![0; width * height],
            x: 0,
            y: 0,
            prev_de: false,
            prev_vsync: false,
            frames: 0,
            capture: None,
        }
    }

    /// Keep copies of up to `limit` completed frames
    pub fn with_capture(mut self, limit: usize) -> Self {
        self.capture = Some((limit, Vec::new()));
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Pixels as `0x00RRGGBB`, row-major
    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffer
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Rgb> {
        if x >= self.width {
            return None;
        }
        self.framebuffer
            .get(y * self.width + x)
            .map(|&p| Rgb::new((p >> 16) as u8, (p >> 8) as u8, p as u8))
    }

    /// Completed frames so far
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn captured(&self) -> &[Vec<u32>] {
        match &self.capture {
            Some((_, frames)) => frames,
            None => &[],
        }
    }

    pub fn ready(&self) -> bool {
        true
    }

    pub fn tick(&mut self, sample: &PixelSample) {
        if sample.valid {
            if sample.de {
                if self.x < self.width && self.y < self.height {
                    self.framebuffer[self.y * self.width + self.x] = sample.rgb().to_u32();
                }
                self.x += 1;
            } else if self.prev_de {
                self.x = 0;
                self.y += 1;
            }

            if sample.vsync && !self.prev_vsync {
                self.finish_frame();
            }
            self.prev_de = sample.de;
            self.prev_vsync = sample.vsync;
        }
    }

    fn finish_frame(&mut self) {
        self.frames += 1;
        debug!(frame = self.frames, lines = self.y, "frame complete");
        if let Some((limit, frames)) = &mut self.capture
            && frames.len() < *limit
        {
            frames.push(self.framebuffer.clone());
            trace!("captured frame {}", frames.len());
        }
        self.x = 0;
        self.y = 0;
    }

    /// The current framebuffer as a binary PPM image
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.reserve(self.framebuffer.len() * 3);
        for &p in &self.framebuffer {
            out.extend_from_slice(&[(p >> 16) as u8, (p >> 8) as u8, p as u8]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(de: bool, vsync: bool, rgb: Rgb) -> PixelSample {
        PixelSample {
            valid: true,
            r: rgb.r,
            g: rgb.g,
            b: rgb.b,
            hsync: false,
            vsync,
            de,
        }
    }

    #[test]
    fn assembles_lines_and_frames() {
        let mut sink = DisplaySink::new(2, 2).with_capture(1);
        let red = Rgb::new(0xff, 0, 0);
        let blue = Rgb::new(0, 0, 0xff);
        for y in 0..2 {
            for x in 0..2 {
                let c = if (x + y) % 2 == 0 { red } else { blue };
                sink.tick(&sample(true, false, c));
            }
            sink.tick(&sample(false, false, Rgb::BLACK));
        }
        assert_eq!(sink.frame_count(), 0);
        sink.tick(&sample(false, true, Rgb::BLACK));
        sink.tick(&sample(false, true, Rgb::BLACK));
        assert_eq!(sink.frame_count(), 1);

        assert_eq!(sink.pixel(0, 0), Some(red));
        assert_eq!(sink.pixel(1, 0), Some(blue));
        assert_eq!(sink.pixel(1, 1), Some(red));
        assert_eq!(sink.captured().len(), 1);
        assert_eq!(sink.captured()[0][1], 0x0000_00ff);
    }

    #[test]
    fn invalid_samples_are_ignored() {
        let mut sink = DisplaySink::new(2, 1);
        let mut s = sample(true, false, Rgb::WHITE);
        s.valid = false;
        sink.tick(&s);
        assert_eq!(sink.framebuffer(), &[0, 0]);
    }

    #[test]
    fn ppm_header_and_payload() {
        let mut sink = DisplaySink::new(1, 1);
        sink.tick(&sample(true, false, Rgb::new(1, 2, 3)));
        let ppm = sink.to_ppm();
        assert!(ppm.starts_with(b"P6\n1 1\n255\n"));
        assert_eq!(&ppm[ppm.len() - 3..], &[1, 2, 3]);
    }
}
