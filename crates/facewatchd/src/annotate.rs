//! Box and label drawing for the annotated stream.

use ab_glyph::{FontVec, PxScale};
use facewatch_core::{FaceObservation, SkipReason};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GRAY: Rgb<u8> = Rgb([160, 160, 160]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_FG: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_PX: f32 = 18.0;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("failed to read font {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid font {0}")]
    InvalidFont(String),
}

/// How a presentable face is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Live and matched.
    Match,
    /// Unmatched, but the best candidate scored above the caution threshold.
    Caution,
    Unknown,
}

impl Verdict {
    pub fn of(obs: &FaceObservation, caution_threshold: f32) -> Self {
        if obs.is_live_match() {
            Verdict::Match
        } else if !obs.is_match() && obs.match_score >= caution_threshold && obs.liveness_live {
            Verdict::Caution
        } else {
            Verdict::Unknown
        }
    }

    pub fn color(self) -> Rgb<u8> {
        match self {
            Verdict::Match => GREEN,
            Verdict::Caution => ORANGE,
            Verdict::Unknown => RED,
        }
    }
}

/// Thinner lines for bigger faces, never below 2 px.
pub fn box_thickness(max_side: i32, thickness_max: i32) -> i32 {
    (150 / max_side.max(1) + 2).clamp(2, thickness_max.max(2))
}

/// `"<name> (<score>)"` for matches and caution candidates, none otherwise.
pub fn label(obs: &FaceObservation, verdict: Verdict) -> Option<String> {
    let name = match verdict {
        Verdict::Match => obs.display_name(),
        Verdict::Caution => obs.best_candidate_name.as_deref().unwrap_or(facewatch_core::types::UNKNOWN_NAME),
        Verdict::Unknown => return None,
    };
    Some(format!("{name} ({:.2})", obs.match_score))
}

pub fn skip_label(reason: &SkipReason) -> String {
    format!("SKIP:{}", reason.code())
}

pub struct Annotator {
    caution_threshold: f32,
    thickness_max: i32,
    font: Option<FontVec>,
    show_skipped: bool,
}

impl Annotator {
    pub fn new(caution_threshold: f32, thickness_max: i32, font: Option<FontVec>) -> Self {
        Self { caution_threshold, thickness_max, font, show_skipped: false }
    }

    /// Draw skipped faces in gray with a `SKIP:<reason>` label.
    pub fn with_show_skipped(mut self, show_skipped: bool) -> Self {
        self.show_skipped = show_skipped;
        self
    }

    pub fn load_font(path: &Path) -> Result<FontVec, AnnotateError> {
        let bytes = std::fs::read(path)
            .map_err(|source| AnnotateError::Read { path: path.display().to_string(), source })?;
        FontVec::try_from_vec(bytes).map_err(|_| AnnotateError::InvalidFont(path.display().to_string()))
    }

    /// Draw every presentable observation onto `image`. Spoofed faces are
    /// left out, skipped ones too unless `show_skipped` is set.
    pub fn draw(&self, image: &mut RgbImage, observations: &[FaceObservation]) {
        for obs in observations {
            if let Some(reason) = &obs.skipped {
                if self.show_skipped {
                    self.draw_box(image, obs, GRAY);
                    if let Some(font) = &self.font {
                        draw_label(image, font, obs.bbox.x1, obs.bbox.y1, &skip_label(reason));
                    }
                }
                continue;
            }
            if !obs.is_presentable() {
                continue;
            }
            let verdict = Verdict::of(obs, self.caution_threshold);
            self.draw_box(image, obs, verdict.color());
            if let (Some(font), Some(text)) = (&self.font, label(obs, verdict)) {
                draw_label(image, font, obs.bbox.x1, obs.bbox.y1, &text);
            }
        }
    }

    fn draw_box(&self, image: &mut RgbImage, obs: &FaceObservation, color: Rgb<u8>) {
        let b = obs.bbox;
        let thickness = box_thickness(b.max_side(), self.thickness_max);
        for i in 0..thickness {
            let w = b.width() - 2 * i;
            let h = b.height() - 2 * i;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(b.x1 + i, b.y1 + i).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, rect, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, font: &FontVec, x: i32, y: i32, text: &str) {
    let scale = PxScale::from(LABEL_PX);
    let (tw, th) = text_size(scale, font, text);
    let baseline = (y - 8).max(th as i32 + 6);
    let bar = Rect::at(x, baseline - th as i32 - 6).of_size(tw + 6, th + 8);
    draw_filled_rect_mut(image, bar, LABEL_BG);
    draw_text_mut(image, LABEL_FG, x + 3, baseline - th as i32 - 3, scale, font, text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::FaceBox;

    fn make_obs(identity: Option<&str>, score: f32) -> FaceObservation {
        let mut obs = FaceObservation::new(FaceBox { x1: 10, y1: 10, x2: 50, y2: 60 });
        obs.matched_identity = identity.map(str::to_string);
        obs.best_candidate_name = Some("alice".into());
        obs.match_score = score;
        obs
    }

    #[test]
    fn test_verdict_colors() {
        assert_eq!(Verdict::of(&make_obs(Some("alice"), 0.8), 0.4), Verdict::Match);
        assert_eq!(Verdict::of(&make_obs(None, 0.45), 0.4), Verdict::Caution);
        assert_eq!(Verdict::of(&make_obs(None, 0.2), 0.4), Verdict::Unknown);
        assert_eq!(Verdict::Caution.color(), ORANGE);
    }

    #[test]
    fn test_box_thickness() {
        assert_eq!(box_thickness(30, 6), 6);
        assert_eq!(box_thickness(100, 6), 3);
        assert_eq!(box_thickness(400, 6), 2);
        assert_eq!(box_thickness(10, 4), 4);
    }

    #[test]
    fn test_labels() {
        let m = make_obs(Some("bob"), 0.823);
        assert_eq!(label(&m, Verdict::Match).as_deref(), Some("bob (0.82)"));
        let c = make_obs(None, 0.45);
        assert_eq!(label(&c, Verdict::Caution).as_deref(), Some("alice (0.45)"));
        assert_eq!(label(&c, Verdict::Unknown), None);
    }

    #[test]
    fn test_draw_skips_unpresentable_faces() {
        let annotator = Annotator::new(0.4, 6, None);
        let mut image = RgbImage::new(80, 80);

        let mut skipped = make_obs(Some("alice"), 0.9);
        skipped.skipped = Some(SkipReason::Embedding("x".into()));
        let mut spoof = make_obs(Some("alice"), 0.9);
        spoof.liveness_checked = true;
        spoof.liveness_live = false;
        annotator.draw(&mut image, &[skipped, spoof]);
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));

        annotator.draw(&mut image, &[make_obs(Some("alice"), 0.9)]);
        assert_eq!(*image.get_pixel(10, 10), GREEN);
        assert_eq!(*image.get_pixel(30, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_show_skipped_draws_gray_box() {
        let annotator = Annotator::new(0.4, 6, None).with_show_skipped(true);
        let mut image = RgbImage::new(80, 80);

        let mut blurry = make_obs(None, 0.0);
        blurry.skipped = Some(SkipReason::Blur { sharpness_percent: 4 });
        let mut spoof = make_obs(Some("alice"), 0.9);
        spoof.bbox = FaceBox { x1: 60, y1: 60, x2: 79, y2: 79 };
        spoof.liveness_checked = true;
        spoof.liveness_live = false;
        annotator.draw(&mut image, &[blurry, spoof]);

        assert_eq!(*image.get_pixel(10, 10), GRAY);
        // Spoofs stay hidden even when skipped faces are shown.
        assert_eq!(*image.get_pixel(60, 60), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_skip_labels() {
        assert_eq!(skip_label(&SkipReason::Blur { sharpness_percent: 12 }), "SKIP:blur");
        assert_eq!(skip_label(&SkipReason::Embedding("x".into())), "SKIP:embedding");
        assert_eq!(skip_label(&SkipReason::LivenessInference("x".into())), "SKIP:liveness");
    }

    #[test]
    fn test_unknown_face_drawn_red() {
        let annotator = Annotator::new(0.4, 6, None);
        let mut image = RgbImage::new(80, 80);
        annotator.draw(&mut image, &[make_obs(None, 0.1)]);
        assert_eq!(*image.get_pixel(10, 30), RED);
    }

    #[test]
    fn test_missing_font_is_error() {
        assert!(matches!(
            Annotator::load_font(Path::new("/nonexistent/font.ttf")),
            Err(AnnotateError::Read { .. })
        ));
    }
}
