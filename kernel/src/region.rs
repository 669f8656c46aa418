//! Rectangle-set region algebra
//!
//! A `Region` is a set of non-overlapping integer rectangles. The compositor
//! uses regions for visibility, clipping and damage tracking. Rectangles may
//! be non-optimal (adjacent but unmerged) except right after `optimize()`.

use alloc::vec::Vec;

use crate::math::{IPoint, IRect};

#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<IRect>,
}

impl Region {
    pub const fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: IRect) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    /// Copy of `other` clipped to `rect`, optionally normalized so that
    /// `rect`'s top-left becomes the origin.
    pub fn from_clipped(other: &Region, rect: IRect, normalize: bool) -> Self {
        let top_left = rect.top_left();
        let mut region = Self::new();
        for r in &other.rects {
            let mut clipped = *r & rect;
            if clipped.is_valid() {
                if normalize {
                    clipped = clipped - top_left;
                }
                region.rects.push(clipped);
            }
        }
        region
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn set(&mut self, rect: IRect) {
        self.rects.clear();
        self.add_rect(rect);
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rect_count(&self) -> usize {
        self.rects.len()
    }

    pub fn rects(&self) -> &[IRect] {
        &self.rects
    }

    /// Append without overlap checking. The caller guarantees disjointness.
    pub fn add_rect(&mut self, rect: IRect) {
        if rect.is_valid() {
            self.rects.push(rect);
        }
    }

    /// Union with a rectangle: the new rectangle is split against every
    /// rectangle it overlaps and only the uncovered remainders are added.
    pub fn include(&mut self, rect: IRect) {
        if !rect.is_valid() {
            return;
        }
        let mut remainder = Region::from_rect(rect);
        for r in &self.rects {
            remainder.exclude(*r);
            if remainder.is_empty() {
                return;
            }
        }
        self.rects.append(&mut remainder.rects);
    }

    /// Remove a rectangle. Every intersecting rectangle is replaced by up to
    /// four fragments: above, below, left-center, right-center.
    pub fn exclude(&mut self, rect: IRect) {
        if !rect.is_valid() {
            return;
        }
        let old = core::mem::take(&mut self.rects);
        for r in old {
            let hide = rect & r;
            if !hide.is_valid() {
                self.rects.push(r);
                continue;
            }
            let fragments = [
                IRect::new(r.left, r.top, r.right, hide.top),      // above, full width
                IRect::new(r.left, hide.bottom, r.right, r.bottom), // below, full width
                IRect::new(r.left, hide.top, hide.left, hide.bottom), // left of center
                IRect::new(hide.right, hide.top, r.right, hide.bottom), // right of center
            ];
            for fragment in fragments {
                if fragment.is_valid() {
                    self.rects.push(fragment);
                }
            }
        }
    }

    pub fn exclude_region(&mut self, other: &Region) {
        for r in &other.rects {
            self.exclude(*r);
        }
    }

    pub fn exclude_region_offset(&mut self, other: &Region, offset: IPoint) {
        for r in &other.rects {
            self.exclude(*r + offset);
        }
    }

    /// Replace with the pairwise intersection of both regions.
    pub fn intersect(&mut self, other: &Region) {
        self.intersect_offset(other, IPoint::new(0, 0));
    }

    pub fn intersect_offset(&mut self, other: &Region, offset: IPoint) {
        let mut result = Vec::new();
        for a in &other.rects {
            let moved = *a + offset;
            for b in &self.rects {
                let isect = moved & *b;
                if isect.is_valid() {
                    result.push(isect);
                }
            }
        }
        self.rects = result;
    }

    pub fn translate(&mut self, offset: IPoint) {
        for r in &mut self.rects {
            *r = *r + offset;
        }
    }

    pub fn contains(&self, p: IPoint) -> bool {
        self.rects.iter().any(|r| r.contains(p))
    }

    pub fn bounds(&self) -> IRect {
        let mut bounds = IRect::new(999_999, 999_999, -999_999, -999_999);
        for r in &self.rects {
            bounds = bounds | *r;
        }
        bounds
    }

    /// Merge adjacent rectangles. Alternates a horizontal pass (merging
    /// rectangles sharing a full vertical edge) with a vertical pass until
    /// neither removes anything.
    pub fn optimize(&mut self) {
        if self.rects.len() <= 1 {
            return;
        }
        let mut some_removed = true;
        while self.rects.len() > 1 && some_removed {
            some_removed = false;

            self.rects.sort_by_key(|r| r.left);
            let mut i = 0;
            while i + 1 < self.rects.len() {
                let curr = self.rects[i];
                let next = self.rects[i + 1];
                if curr.right == next.left && curr.top == next.top && curr.bottom == next.bottom {
                    self.rects[i].right = next.right;
                    self.rects.remove(i + 1);
                    some_removed = true;
                } else {
                    i += 1;
                }
            }
            if self.rects.len() <= 1 {
                break;
            }

            self.rects.sort_by_key(|r| r.top);
            let mut i = 0;
            while i + 1 < self.rects.len() {
                let curr = self.rects[i];
                let next = self.rects[i + 1];
                if curr.bottom == next.top && curr.left == next.left && curr.right == next.right {
                    self.rects[i].bottom = next.bottom;
                    self.rects.remove(i + 1);
                    some_removed = true;
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Clip the segment `p1`..`p2` against `rect`, moving the endpoints onto
    /// the rectangle edges. Returns false when the segment lies entirely
    /// outside. The intersection rounding matches the display driver's line
    /// engine so clipped spans stay pixel-identical to unclipped ones.
    pub fn clip_line(rect: &IRect, p1: &mut IPoint, p2: &mut IPoint) -> bool {
        let p1_inside = rect.contains(*p1);
        let p2_inside = rect.contains(*p2);

        if p1_inside && p2_inside {
            return true;
        }

        // Both endpoints on the outside of the same edge: fully invisible.
        let mut clip_always = false;
        if !p1_inside && !p2_inside {
            if (p1.x < rect.left && p2.x < rect.left)
                || (p1.x >= rect.right && p2.x >= rect.right)
                || (p1.y < rect.top && p2.y < rect.top)
                || (p1.y >= rect.bottom && p2.y >= rect.bottom)
            {
                return false;
            }
            // The segment cuts through the rectangle without either endpoint
            // inside it. Both ends must be clipped.
            clip_always = true;
        }

        let mut success = false;

        if p1_inside || clip_always {
            success |= clip_endpoint(rect, *p1, p2, true);
        }
        if p2_inside || clip_always {
            success |= clip_endpoint(rect, *p2, p1, false);
        }
        success
    }
}

/// Clip `moving` toward the rectangle along the segment from `anchor`.
/// The forward pass rounds x-edge intersections up, the return pass rounds
/// to nearest; callers order the segment left-to-right so the two passes
/// land on the same pixels the line engine would touch.
fn clip_endpoint(rect: &IRect, anchor: IPoint, moving: &mut IPoint, forward: bool) -> bool {
    let dx = moving.x - anchor.x;
    let dy = moving.y - anchor.y;

    let mut right_edge = false;
    let mut left_edge = false;
    let mut top_edge = false;
    let mut bottom_edge = false;

    let mut xi = 0;
    let mut yi = 0;

    let h_rounding = if forward { dx - 1 } else { dx / 2 };
    if moving.x >= rect.right {
        right_edge = true;
        if dx != 0 {
            let h_offset = rect.right - 1 - anchor.x;
            yi = (dy * h_offset + h_rounding) / dx + anchor.y;
        } else {
            yi = -1;
        }
    } else if moving.x < rect.left {
        left_edge = true;
        if dx != 0 {
            let h_offset = rect.left - anchor.x;
            yi = (dy * h_offset + h_rounding) / dx + anchor.y;
        } else {
            yi = -1;
        }
    }

    if moving.y >= rect.bottom {
        bottom_edge = true;
        if dy != 0 {
            let v_delta = rect.bottom - 1 - anchor.y;
            xi = (dx * v_delta + dy / 2) / dy + anchor.x;
        } else {
            xi = -1;
        }
    } else if moving.y < rect.top {
        top_edge = true;
        if dy != 0 {
            let v_delta = rect.top - anchor.y;
            xi = (dx * v_delta + dy / 2) / dy + anchor.x;
        } else {
            xi = -1;
        }
    }

    let mut success = false;

    if right_edge && yi >= rect.top && yi < rect.bottom {
        moving.x = rect.right - 1;
        moving.y = yi;
        success = true;
    } else if left_edge && yi >= rect.top && yi < rect.bottom {
        moving.x = rect.left;
        moving.y = yi;
        success = true;
    }

    if bottom_edge && xi >= rect.left && xi < rect.right {
        moving.x = xi;
        moving.y = rect.bottom - 1;
        success = true;
    } else if top_edge && xi >= rect.left && xi < rect.right {
        moving.x = xi;
        moving.y = rect.top;
        success = true;
    }
    success
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_no_overlap(region: &Region) {
        let rects = region.rects();
        for (i, a) in rects.iter().enumerate() {
            for b in &rects[i + 1..] {
                assert!(!a.intersects(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    fn points_in(bounds: IRect) -> impl Iterator<Item = IPoint> {
        (bounds.top..bounds.bottom)
            .flat_map(move |y| (bounds.left..bounds.right).map(move |x| IPoint::new(x, y)))
    }

    #[test]
    fn exclude_produces_four_fragments() {
        let mut region = Region::from_rect(IRect::new(0, 0, 100, 100));
        region.exclude(IRect::new(20, 20, 80, 80));

        let mut rects: Vec<IRect> = region.rects().to_vec();
        rects.sort_by_key(|r| (r.top, r.left));
        assert_eq!(
            rects,
            alloc::vec![
                IRect::new(0, 0, 100, 20),
                IRect::new(0, 20, 20, 80),
                IRect::new(80, 20, 100, 80),
                IRect::new(0, 80, 100, 100),
            ]
        );
        assert_no_overlap(&region);
    }

    #[test]
    fn include_law() {
        // For every point: included(p) == old(p) || p in X
        let mut region = Region::from_rect(IRect::new(0, 0, 100, 100));
        region.exclude(IRect::new(20, 20, 80, 80));
        let before = region.clone();

        let x = IRect::new(50, 50, 150, 150);
        region.include(x);

        assert_no_overlap(&region);
        for p in points_in(IRect::new(-5, -5, 160, 160)) {
            assert_eq!(
                region.contains(p),
                before.contains(p) || x.contains(p),
                "point {p:?}"
            );
        }
    }

    #[test]
    fn exclude_law() {
        let mut region = Region::from_rect(IRect::new(0, 0, 40, 40));
        region.include(IRect::new(30, 30, 70, 70));
        let before = region.clone();

        let x = IRect::new(10, 10, 50, 50);
        region.exclude(x);

        assert_no_overlap(&region);
        for p in points_in(IRect::new(-5, -5, 80, 80)) {
            assert_eq!(
                region.contains(p),
                before.contains(p) && !x.contains(p),
                "point {p:?}"
            );
        }
    }

    #[test]
    fn intersect_law() {
        let mut a = Region::from_rect(IRect::new(0, 0, 50, 50));
        a.include(IRect::new(40, 40, 90, 90));
        let mut b = Region::from_rect(IRect::new(25, 0, 60, 100));
        b.exclude(IRect::new(30, 30, 35, 35));

        let a_before = a.clone();
        a.intersect(&b);

        assert_no_overlap(&a);
        for p in points_in(IRect::new(0, 0, 100, 100)) {
            assert_eq!(a.contains(p), a_before.contains(p) && b.contains(p));
        }
    }

    #[test]
    fn optimize_merges_and_is_idempotent() {
        let mut region = Region::new();
        // A 2x2 grid of touching tiles collapses to one rectangle.
        region.add_rect(IRect::new(0, 0, 10, 10));
        region.add_rect(IRect::new(10, 0, 20, 10));
        region.add_rect(IRect::new(0, 10, 10, 20));
        region.add_rect(IRect::new(10, 10, 20, 20));
        region.optimize();
        assert_eq!(region.rects(), &[IRect::new(0, 0, 20, 20)]);

        let mut hole = Region::from_rect(IRect::new(0, 0, 100, 100));
        hole.exclude(IRect::new(20, 20, 80, 80));
        hole.optimize();
        let mut first: Vec<IRect> = hole.rects().to_vec();
        first.sort_by_key(|r| (r.top, r.left));
        hole.optimize();
        let mut second: Vec<IRect> = hole.rects().to_vec();
        second.sort_by_key(|r| (r.top, r.left));
        assert_eq!(first, second);
    }

    #[test]
    fn clip_line_inside_is_untouched() {
        let rect = IRect::new(0, 0, 100, 100);
        let mut p1 = IPoint::new(10, 10);
        let mut p2 = IPoint::new(90, 90);
        assert!(Region::clip_line(&rect, &mut p1, &mut p2));
        assert_eq!(p1, IPoint::new(10, 10));
        assert_eq!(p2, IPoint::new(90, 90));
    }

    #[test]
    fn clip_line_rejects_outside() {
        let rect = IRect::new(0, 0, 100, 100);
        let mut p1 = IPoint::new(-10, -10);
        let mut p2 = IPoint::new(-5, 120);
        assert!(!Region::clip_line(&rect, &mut p1, &mut p2));
    }

    #[test]
    fn clip_line_clamps_endpoints() {
        let rect = IRect::new(0, 0, 100, 100);
        let mut p1 = IPoint::new(50, 50);
        let mut p2 = IPoint::new(50, 200);
        assert!(Region::clip_line(&rect, &mut p1, &mut p2));
        assert_eq!(p2, IPoint::new(50, 99));

        // Horizontal crossing with both endpoints outside.
        let mut p1 = IPoint::new(-50, 40);
        let mut p2 = IPoint::new(150, 40);
        assert!(Region::clip_line(&rect, &mut p1, &mut p2));
        assert_eq!(p1.y, 40);
        assert_eq!(p2.y, 40);
        assert!(p1.x >= 0 && p2.x <= 99);
    }

    #[test]
    fn from_clipped_normalizes() {
        let mut region = Region::from_rect(IRect::new(10, 10, 50, 50));
        region.include(IRect::new(60, 10, 80, 30));
        let clipped = Region::from_clipped(&region, IRect::new(20, 20, 70, 70), true);
        assert_no_overlap(&clipped);
        let mut rects: Vec<IRect> = clipped.rects().to_vec();
        rects.sort_by_key(|r| (r.top, r.left));
        assert_eq!(
            rects,
            alloc::vec![IRect::new(0, 0, 30, 30), IRect::new(40, 0, 50, 10)]
        );
    }
}
