//! Chunk planning over the master timeline.
//!
//! Pure functions for tiling a file into overlapping analysis windows and
//! for choosing which regions deserve a second, finer pass.

use serde::{Deserialize, Serialize};

use super::drift::DriftPoint;
use super::types::{Chunk, ChunkPass};

/// Chunk layout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlanConfig {
    /// Coarse window length in seconds.
    pub chunk_seconds: f64,
    /// Fraction of each coarse window shared with the next (0..1).
    pub overlap: f64,
    /// Refinement window length in seconds.
    pub refine_chunk_seconds: f64,
    /// Overlap fraction of refinement windows.
    pub refine_overlap: f64,
    /// Adjacent reliable offsets further apart than this are flagged.
    pub disagreement_seconds: f64,
    /// Neighbouring chunks pulled into a flagged region on each side.
    pub neighbor_context: usize,
}

impl Default for ChunkPlanConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: 30.0,
            overlap: 0.7,
            refine_chunk_seconds: 10.0,
            refine_overlap: 0.8,
            disagreement_seconds: 0.25,
            neighbor_context: 1,
        }
    }
}

/// Span of the master timeline, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRegion {
    pub start: f64,
    pub end: f64,
}

/// Plans coarse and refinement chunks.
pub struct ChunkPlanner {
    config: ChunkPlanConfig,
}

impl ChunkPlanner {
    pub fn new(config: ChunkPlanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkPlanConfig {
        &self.config
    }

    /// Tile the whole file with overlapping coarse windows.
    ///
    /// # Arguments
    /// * `duration` - Duration in seconds of the shorter track
    ///
    /// # Returns
    /// Chunks starting at 0 and covering `[0, duration)`. The last window is
    /// clipped to the end of the file; a file shorter than one window gets a
    /// single chunk spanning it.
    pub fn plan_coarse(&self, duration: f64) -> Vec<Chunk> {
        tile(
            TimeRegion {
                start: 0.0,
                end: duration,
            },
            self.config.chunk_seconds,
            self.config.overlap,
            ChunkPass::Coarse,
            0,
        )
    }

    /// Regions of a coarse timeline that need a refinement pass.
    ///
    /// A chunk is flagged when it is unreliable or when its offset disagrees
    /// with a reliable neighbour by more than the disagreement threshold.
    /// Flags spread to `neighbor_context` chunks on each side and runs of
    /// flagged chunks merge into one region.
    pub fn refinement_regions(&self, points: &[DriftPoint]) -> Vec<TimeRegion> {
        let coarse: Vec<&DriftPoint> = points
            .iter()
            .filter(|p| p.chunk.pass == ChunkPass::Coarse)
            .collect();
        let n = coarse.len();
        let mut flagged = vec![false; n];

        for (i, point) in coarse.iter().enumerate() {
            if !point.reliable {
                flagged[i] = true;
            }
        }
        for i in 1..n {
            let (prev, cur) = (coarse[i - 1], coarse[i]);
            if prev.reliable
                && cur.reliable
                && (prev.estimate.offset_seconds - cur.estimate.offset_seconds).abs()
                    > self.config.disagreement_seconds
            {
                flagged[i - 1] = true;
                flagged[i] = true;
            }
        }

        let context = self.config.neighbor_context;
        let mut expanded = flagged.clone();
        for (i, &flag) in flagged.iter().enumerate() {
            if flag {
                let lo = i.saturating_sub(context);
                let hi = (i + context).min(n.saturating_sub(1));
                for slot in &mut expanded[lo..=hi] {
                    *slot = true;
                }
            }
        }

        let mut regions = Vec::new();
        let mut i = 0;
        while i < n {
            if !expanded[i] {
                i += 1;
                continue;
            }
            let first = i;
            while i + 1 < n && expanded[i + 1] {
                i += 1;
            }
            regions.push(TimeRegion {
                start: coarse[first].chunk.start_time,
                end: coarse[i].chunk.end_time,
            });
            i += 1;
        }

        regions
    }

    /// Tile refinement regions with smaller windows.
    ///
    /// # Arguments
    /// * `regions` - Regions to refine; overlapping regions are merged first
    /// * `first_index` - Index given to the first refinement chunk
    pub fn plan_refinement(&self, regions: &[TimeRegion], first_index: usize) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for region in merge_regions(regions.to_vec()) {
            let tiled = tile(
                region,
                self.config.refine_chunk_seconds,
                self.config.refine_overlap,
                ChunkPass::Refine,
                first_index + chunks.len(),
            );
            chunks.extend(tiled);
        }
        chunks
    }
}

/// Sort regions and merge those that touch or overlap.
pub fn merge_regions(mut regions: Vec<TimeRegion>) -> Vec<TimeRegion> {
    regions.retain(|r| r.end > r.start);
    regions.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<TimeRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(last) if region.start <= last.end => last.end = last.end.max(region.end),
            _ => merged.push(region),
        }
    }
    merged
}

/// Overlapping windows of `window` seconds across a region.
fn tile(region: TimeRegion, window: f64, overlap: f64, pass: ChunkPass, first_index: usize) -> Vec<Chunk> {
    if region.end <= region.start {
        return vec![];
    }
    if region.end - region.start <= window {
        return vec![Chunk {
            index: first_index,
            start_time: region.start,
            end_time: region.end,
            pass,
        }];
    }

    let step = (window * (1.0 - overlap.clamp(0.0, 0.95))).max(1e-3);
    let mut chunks = Vec::new();
    let mut k = 0usize;
    loop {
        let start = region.start + k as f64 * step;
        let end = (start + window).min(region.end);
        chunks.push(Chunk {
            index: first_index + chunks.len(),
            start_time: start,
            end_time: end,
            pass,
        });
        if end >= region.end {
            break;
        }
        k += 1;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::content::ContentClass;
    use crate::analysis::types::{Method, OffsetEstimate};

    fn point(index: usize, start: f64, offset: f64, reliable: bool) -> DriftPoint {
        DriftPoint {
            chunk: Chunk {
                index,
                start_time: start,
                end_time: start + 30.0,
                pass: ChunkPass::Coarse,
            },
            estimate: OffsetEstimate::new(Method::Onset, offset, 0.8, 0.032, 16000),
            base_confidence: 0.8,
            content: ContentClass::Music,
            reliable,
            guide_seconds: None,
            failure: None,
        }
    }

    #[test]
    fn coarse_tiles_cover_file_and_clip_last_window() {
        let planner = ChunkPlanner::new(ChunkPlanConfig::default());
        let chunks = planner.plan_coarse(100.0);

        assert_eq!(chunks[0].start_time, 0.0);
        assert_eq!(chunks.last().unwrap().end_time, 100.0);
        for pair in chunks.windows(2) {
            assert!((pair[1].start_time - pair[0].start_time - 9.0).abs() < 1e-9);
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
        // 0, 9, ..., 72 start full windows; 72 + 30 > 100 so that one is clipped.
        assert_eq!(chunks.len(), 9);
        assert!(chunks.iter().all(|c| c.duration_secs() <= 30.0 + 1e-9));
    }

    #[test]
    fn short_file_gets_one_chunk() {
        let planner = ChunkPlanner::new(ChunkPlanConfig::default());
        let chunks = planner.plan_coarse(12.5);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_time, 0.0);
        assert_eq!(chunks[0].end_time, 12.5);
    }

    #[test]
    fn consistent_reliable_timeline_needs_no_refinement() {
        let planner = ChunkPlanner::new(ChunkPlanConfig::default());
        let points: Vec<DriftPoint> = (0..5).map(|i| point(i, i as f64 * 9.0, 1.5, true)).collect();
        assert!(planner.refinement_regions(&points).is_empty());
    }

    #[test]
    fn disagreement_flags_both_sides_with_context() {
        let config = ChunkPlanConfig {
            neighbor_context: 1,
            ..ChunkPlanConfig::default()
        };
        let planner = ChunkPlanner::new(config);
        let offsets = [1.0, 1.0, 1.0, 1.0, 3.0, 3.0, 3.0, 3.0];
        let points: Vec<DriftPoint> = offsets
            .iter()
            .enumerate()
            .map(|(i, &o)| point(i, i as f64 * 9.0, o, true))
            .collect();

        let regions = planner.refinement_regions(&points);
        assert_eq!(regions.len(), 1);
        // Chunks 3 and 4 disagree; context pulls in 2 and 5.
        assert_eq!(regions[0].start, 18.0);
        assert_eq!(regions[0].end, 45.0 + 30.0);
    }

    #[test]
    fn unreliable_chunks_are_refined() {
        let config = ChunkPlanConfig {
            neighbor_context: 0,
            ..ChunkPlanConfig::default()
        };
        let planner = ChunkPlanner::new(config);
        let points = vec![
            point(0, 0.0, 1.0, true),
            point(1, 9.0, 0.0, false),
            point(2, 18.0, 1.0, true),
            point(3, 27.0, 1.0, true),
            point(4, 36.0, 0.0, false),
        ];

        let regions = planner.refinement_regions(&points);
        assert_eq!(
            regions,
            vec![
                TimeRegion { start: 9.0, end: 39.0 },
                TimeRegion { start: 36.0, end: 66.0 },
            ]
        );

        let refine = planner.plan_refinement(&regions, 5);
        assert_eq!(refine[0].index, 5);
        assert!(refine.iter().all(|c| c.pass == ChunkPass::Refine));
        assert_eq!(refine.first().unwrap().start_time, 9.0);
        assert_eq!(refine.last().unwrap().end_time, 66.0);
    }

    #[test]
    fn merge_joins_overlapping_regions() {
        let merged = merge_regions(vec![
            TimeRegion { start: 50.0, end: 60.0 },
            TimeRegion { start: 0.0, end: 10.0 },
            TimeRegion { start: 5.0, end: 20.0 },
        ]);
        assert_eq!(
            merged,
            vec![
                TimeRegion { start: 0.0, end: 20.0 },
                TimeRegion { start: 50.0, end: 60.0 },
            ]
        );
    }
}
