//! ShortTermTracker: keeps face boxes moving between detection cycles using
//! sparse optical flow.
//!
//! Detection results arrive with a version number. A new version resyncs the
//! tracks (IoU association, blended boxes, fresh feature points); every other
//! frame advances the boxes by the median flow of their points.

use crate::flow::{good_features, FeatureParams, FlowEstimator, LucasKanade};
use crate::types::{iou_xyxy, FaceBox, FaceObservation};
use image::GrayImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

const RNG_SEED: u64 = 0x5eed_f10e;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    /// Weight of the previous box when blending with a new detection.
    pub blend_old: f32,
    pub min_roi_pixels: u32,
    pub min_seed_points: usize,
    pub min_track_points: usize,
    pub reseed_below: usize,
    pub reseed_after: Duration,
    pub max_lost: u32,
    pub scale_sample: usize,
    pub scale_range: (f32, f32),
    pub aspect_range: (f32, f32),
    pub features: FeatureParams,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.2,
            blend_old: 0.4,
            min_roi_pixels: 400,
            min_seed_points: 6,
            min_track_points: 4,
            reseed_below: 10,
            reseed_after: Duration::from_millis(600),
            max_lost: 5,
            scale_sample: 20,
            scale_range: (0.85, 1.20),
            aspect_range: (0.6, 1.9),
            features: FeatureParams::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Track {
    bbox: [f32; 4],
    points: Vec<(f32, f32)>,
    lost: u32,
    last_refresh: Instant,
    observation: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// No track was created; the detected box is shown as is.
    Untracked,
    Tracked,
    /// Its track was dropped; the observation is no longer shown.
    Evicted,
}

pub struct ShortTermTracker {
    tracks: Vec<Track>,
    observations: Vec<FaceObservation>,
    links: Vec<Link>,
    prev_gray: Option<GrayImage>,
    version: u64,
    flow: Box<dyn FlowEstimator>,
    rng: StdRng,
    config: TrackerConfig,
}

impl Default for ShortTermTracker {
    fn default() -> Self {
        Self::new(Box::new(LucasKanade::default()), TrackerConfig::default())
    }
}

impl ShortTermTracker {
    pub fn new(flow: Box<dyn FlowEstimator>, config: TrackerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            observations: Vec::new(),
            links: Vec::new(),
            prev_gray: None,
            version: 0,
            flow,
            rng: StdRng::seed_from_u64(RNG_SEED),
            config,
        }
    }

    /// Detection version the tracker was last synced to.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Replace the observation batch and rebuild tracks against it.
    pub fn resync(
        &mut self,
        observations: Vec<FaceObservation>,
        gray: &GrayImage,
        version: u64,
        now: Instant,
    ) {
        let old = std::mem::take(&mut self.tracks);
        let detected: Vec<[f32; 4]> = observations.iter().map(|o| o.bbox.as_f32()).collect();

        // Greedy unique association by descending IoU.
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (di, det) in detected.iter().enumerate() {
            if observations[di].skipped.is_some() {
                continue;
            }
            for (ti, track) in old.iter().enumerate() {
                let iou = iou_xyxy(&track.bbox, det);
                if iou >= self.config.iou_threshold {
                    pairs.push((iou, di, ti));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        let mut matched: Vec<Option<usize>> = vec![None; detected.len()];
        let mut used = vec![false; old.len()];
        for (_, di, ti) in pairs {
            if matched[di].is_none() && !used[ti] {
                matched[di] = Some(ti);
                used[ti] = true;
            }
        }

        let mut links = vec![Link::Untracked; observations.len()];
        for (di, det) in detected.iter().enumerate() {
            if observations[di].skipped.is_some() {
                continue;
            }
            let Some(points) = self.seed_points(gray, det) else {
                continue;
            };
            let bbox = match matched[di] {
                Some(ti) => blend(&old[ti].bbox, det, self.config.blend_old),
                None => *det,
            };
            self.tracks.push(Track { bbox, points, lost: 0, last_refresh: now, observation: di });
            links[di] = Link::Tracked;
        }

        tracing::debug!(
            faces = observations.len(),
            tracks = self.tracks.len(),
            version,
            "tracker resynced"
        );
        self.observations = observations;
        self.links = links;
        self.prev_gray = Some(gray.clone());
        self.version = version;
    }

    /// Move every track by the flow between the previous frame and `gray`.
    pub fn advance(&mut self, gray: &GrayImage, now: Instant) {
        let Some(prev) = self.prev_gray.take() else {
            self.prev_gray = Some(gray.clone());
            return;
        };
        if self.tracks.is_empty() || prev.dimensions() != gray.dimensions() {
            self.prev_gray = Some(gray.clone());
            return;
        }

        let (w, h) = (gray.width() as f32, gray.height() as f32);
        let mut tracks = std::mem::take(&mut self.tracks);
        for track in &mut tracks {
            if track.points.len() < self.config.min_track_points {
                track.lost += 1;
                continue;
            }
            let moved = self.flow.track(&prev, gray, &track.points);
            let pairs: Vec<((f32, f32), (f32, f32))> = track
                .points
                .iter()
                .zip(moved)
                .filter_map(|(&a, b)| b.map(|b| (a, b)))
                .collect();
            if pairs.is_empty() {
                track.lost += 1;
                continue;
            }

            let dx = median(pairs.iter().map(|(a, b)| b.0 - a.0).collect());
            let dy = median(pairs.iter().map(|(a, b)| b.1 - a.1).collect());
            let scale = self
                .estimate_scale(&pairs)
                .clamp(self.config.scale_range.0, self.config.scale_range.1);

            track.bbox = self.moved_box(&track.bbox, dx, dy, scale, w, h);
            track.points = pairs.into_iter().map(|(_, b)| b).collect();

            if track.points.len() < self.config.reseed_below
                || now.saturating_duration_since(track.last_refresh) > self.config.reseed_after
            {
                if let Some(fresh) = self.seed_points(gray, &track.bbox) {
                    track.points = fresh;
                    track.last_refresh = now;
                }
            }
            track.lost = 0;
        }

        let max_lost = self.config.max_lost;
        for track in tracks.iter().filter(|t| t.lost > max_lost) {
            if let Some(link) = self.links.get_mut(track.observation) {
                *link = Link::Evicted;
            }
        }
        tracks.retain(|t| t.lost <= max_lost);
        self.tracks = tracks;
        self.prev_gray = Some(gray.clone());
    }

    /// Current batch with tracked boxes substituted. Evicted faces are omitted.
    pub fn observations(&self) -> Vec<FaceObservation> {
        let Some(gray) = &self.prev_gray else {
            return self.observations.clone();
        };
        let (w, h) = gray.dimensions();
        self.observations
            .iter()
            .enumerate()
            .filter_map(|(i, obs)| match self.links.get(i).copied().unwrap_or(Link::Untracked) {
                Link::Untracked => Some(obs.clone()),
                Link::Evicted => None,
                Link::Tracked => {
                    let track = self.tracks.iter().find(|t| t.observation == i)?;
                    let [x1, y1, x2, y2] = track.bbox;
                    FaceBox::clipped(x1, y1, x2, y2, w, h).map(|b| obs.with_bbox(b))
                }
            })
            .collect()
    }

    fn seed_points(&self, gray: &GrayImage, bbox: &[f32; 4]) -> Option<Vec<(f32, f32)>> {
        let (w, h) = (gray.width() as i64, gray.height() as i64);
        if w < 2 || h < 2 {
            return None;
        }
        let x1 = (bbox[0].round() as i64).clamp(0, w - 2);
        let x2 = (bbox[2].round() as i64).clamp(1, w - 1);
        let y1 = (bbox[1].round() as i64).clamp(0, h - 2);
        let y2 = (bbox[3].round() as i64).clamp(1, h - 1);
        if x2 <= x1 || y2 <= y1 || (x2 - x1) * (y2 - y1) < self.config.min_roi_pixels as i64 {
            return None;
        }
        let points = good_features(
            gray,
            [x1 as u32, y1 as u32, x2 as u32, y2 as u32],
            &self.config.features,
        );
        (points.len() >= self.config.min_seed_points).then_some(points)
    }

    /// Ratio of median point spread after vs before the move, over a random
    /// subsample; 1.0 with too few points.
    fn estimate_scale(&mut self, pairs: &[((f32, f32), (f32, f32))]) -> f32 {
        if pairs.len() < self.config.reseed_below {
            return 1.0;
        }
        let k = self.config.scale_sample.min(pairs.len());
        let picked: Vec<&((f32, f32), (f32, f32))> =
            rand::seq::index::sample(&mut self.rng, pairs.len(), k)
                .into_iter()
                .map(|i| &pairs[i])
                .collect();
        let before: Vec<(f32, f32)> = picked.iter().map(|p| p.0).collect();
        let after: Vec<(f32, f32)> = picked.iter().map(|p| p.1).collect();
        let spread_before = median_spread(&before) + 1e-6;
        let spread_after = median_spread(&after) + 1e-6;
        spread_after / spread_before
    }

    fn moved_box(&self, bbox: &[f32; 4], dx: f32, dy: f32, scale: f32, w: f32, h: f32) -> [f32; 4] {
        let [x1, y1, x2, y2] = *bbox;
        let cx = 0.5 * (x1 + x2) + dx;
        let cy = 0.5 * (y1 + y2) + dy;
        let mut bw = (x2 - x1) * scale;
        let mut bh = (y2 - y1) * scale;
        let aspect = bw / (bh + 1e-6);
        let (min_ar, max_ar) = self.config.aspect_range;
        if aspect < min_ar {
            bw = bh * min_ar;
        }
        if aspect > max_ar {
            bh = bw / max_ar;
        }
        [
            (cx - 0.5 * bw).clamp(0.0, (w - 2.0).max(0.0)),
            (cy - 0.5 * bh).clamp(0.0, (h - 2.0).max(0.0)),
            (cx + 0.5 * bw).clamp(1.0, (w - 1.0).max(1.0)),
            (cy + 0.5 * bh).clamp(1.0, (h - 1.0).max(1.0)),
        ]
    }
}

fn blend(old: &[f32; 4], new: &[f32; 4], w_old: f32) -> [f32; 4] {
    std::array::from_fn(|i| w_old * old[i] + (1.0 - w_old) * new[i])
}

fn median(mut v: Vec<f32>) -> f32 {
    if v.is_empty() {
        return 0.0;
    }
    v.sort_by(f32::total_cmp);
    let n = v.len();
    if n % 2 == 1 {
        v[n / 2]
    } else {
        (v[n / 2 - 1] + v[n / 2]) * 0.5
    }
}

/// Median distance of points to their per-axis median center.
fn median_spread(points: &[(f32, f32)]) -> f32 {
    let cx = median(points.iter().map(|p| p.0).collect());
    let cy = median(points.iter().map(|p| p.1).collect());
    median(points.iter().map(|p| (p.0 - cx).hypot(p.1 - cy)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Moves every point by a fixed offset, or loses them all.
    struct ShiftFlow(Option<(f32, f32)>);

    impl FlowEstimator for ShiftFlow {
        fn track(&mut self, _prev: &GrayImage, _next: &GrayImage, points: &[(f32, f32)]) -> Vec<Option<(f32, f32)>> {
            points.iter().map(|p| self.0.map(|(dx, dy)| (p.0 + dx, p.1 + dy))).collect()
        }
    }

    /// Moves points away from (cx, cy) by `factor`.
    struct ZoomFlow {
        center: (f32, f32),
        factor: f32,
    }

    impl FlowEstimator for ZoomFlow {
        fn track(&mut self, _prev: &GrayImage, _next: &GrayImage, points: &[(f32, f32)]) -> Vec<Option<(f32, f32)>> {
            let (cx, cy) = self.center;
            points
                .iter()
                .map(|p| Some((cx + (p.0 - cx) * self.factor, cy + (p.1 - cy) * self.factor)))
                .collect()
        }
    }

    fn make_frame() -> GrayImage {
        GrayImage::from_fn(200, 200, |x, y| Luma([if (x / 5 + y / 5) % 2 == 0 { 30 } else { 220 }]))
    }

    fn make_obs(x1: i32, y1: i32, x2: i32, y2: i32) -> FaceObservation {
        FaceObservation::new(FaceBox { x1, y1, x2, y2 })
    }

    fn tracker_with(flow: impl FlowEstimator + 'static) -> ShortTermTracker {
        ShortTermTracker::new(Box::new(flow), TrackerConfig::default())
    }

    #[test]
    fn test_uniform_flow_moves_box() {
        let gray = make_frame();
        let mut tracker = tracker_with(ShiftFlow(Some((5.0, 0.0))));
        let t0 = Instant::now();
        tracker.resync(vec![make_obs(10, 10, 50, 50)], &gray, 1, t0);
        assert_eq!(tracker.track_count(), 1);

        tracker.advance(&gray, t0 + Duration::from_millis(30));
        let obs = tracker.observations();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].bbox, FaceBox { x1: 15, y1: 10, x2: 55, y2: 50 });
    }

    #[test]
    fn test_zero_flow_keeps_box() {
        let gray = make_frame();
        let mut tracker = tracker_with(ShiftFlow(Some((0.0, 0.0))));
        let t0 = Instant::now();
        tracker.resync(vec![make_obs(60, 40, 140, 150)], &gray, 1, t0);
        for i in 1..5 {
            tracker.advance(&gray, t0 + Duration::from_millis(40 * i));
        }
        assert_eq!(tracker.observations()[0].bbox, FaceBox { x1: 60, y1: 40, x2: 140, y2: 150 });
    }

    #[test]
    fn test_scale_is_clamped() {
        let gray = make_frame();
        let mut tracker = tracker_with(ZoomFlow { center: (100.0, 100.0), factor: 2.0 });
        let t0 = Instant::now();
        tracker.resync(vec![make_obs(60, 60, 140, 140)], &gray, 1, t0);
        tracker.advance(&gray, t0 + Duration::from_millis(30));
        let b = tracker.observations()[0].bbox;
        // 80 px box grows by at most 1.2x.
        assert_eq!(b.width(), 96);
        assert_eq!(b.height(), 96);
    }

    #[test]
    fn test_lost_track_is_evicted() {
        let gray = make_frame();
        let mut tracker = tracker_with(ShiftFlow(None));
        let t0 = Instant::now();
        tracker.resync(vec![make_obs(10, 10, 50, 50), make_obs(2, 150, 12, 160)], &gray, 1, t0);
        // Second face is too small to seed and keeps its detected box.
        assert_eq!(tracker.track_count(), 1);

        for i in 1..=5 {
            tracker.advance(&gray, t0 + Duration::from_millis(30 * i));
        }
        assert_eq!(tracker.observations().len(), 2);
        tracker.advance(&gray, t0 + Duration::from_millis(200));
        let obs = tracker.observations();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].bbox, FaceBox { x1: 2, y1: 150, x2: 12, y2: 160 });
    }

    #[test]
    fn test_resync_blends_matched_track() {
        let gray = make_frame();
        let mut tracker = tracker_with(ShiftFlow(Some((0.0, 0.0))));
        let t0 = Instant::now();
        tracker.resync(vec![make_obs(10, 10, 60, 60)], &gray, 1, t0);
        tracker.resync(vec![make_obs(20, 10, 70, 60)], &gray, 2, t0);
        assert_eq!(tracker.version(), 2);
        // 0.4 * 10 + 0.6 * 20 = 16
        assert_eq!(tracker.observations()[0].bbox, FaceBox { x1: 16, y1: 10, x2: 66, y2: 60 });
    }

    #[test]
    fn test_box_count_never_exceeds_batch() {
        let gray = make_frame();
        let mut tracker = tracker_with(ShiftFlow(Some((1.0, 1.0))));
        let t0 = Instant::now();
        let batch = vec![make_obs(10, 10, 50, 50), make_obs(100, 100, 150, 150)];
        tracker.resync(batch.clone(), &gray, 1, t0);
        tracker.advance(&gray, t0 + Duration::from_millis(30));
        assert!(tracker.observations().len() <= batch.len());
        assert!(tracker.track_count() <= batch.len());
    }

    #[test]
    fn test_box_clamped_at_frame_edge() {
        let gray = make_frame();
        let mut tracker = tracker_with(ShiftFlow(Some((40.0, 0.0))));
        let t0 = Instant::now();
        tracker.resync(vec![make_obs(140, 10, 190, 60)], &gray, 1, t0);
        tracker.advance(&gray, t0 + Duration::from_millis(30));
        let b = tracker.observations()[0].bbox;
        assert_eq!(b.x2, 199);
        assert!(b.x1 < b.x2);
    }

    #[test]
    fn test_skipped_observation_not_tracked() {
        let gray = make_frame();
        let mut tracker = tracker_with(ShiftFlow(Some((0.0, 0.0))));
        let mut obs = make_obs(10, 10, 50, 50);
        obs.skipped = Some(crate::types::SkipReason::Embedding("x".into()));
        tracker.resync(vec![obs], &gray, 1, Instant::now());
        assert_eq!(tracker.track_count(), 0);
    }
}
