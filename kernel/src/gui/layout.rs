//! Layout engine
//!
//! Each view carries a layout node deciding how its children share its
//! bounds. Horizontal and vertical nodes distribute the slack between
//! minimum and maximum child sizes by layout weight; a child hitting its
//! maximum drops out and the remainder is redistributed. Whatever slack no
//! child can absorb becomes even inter-child padding.

use alloc::vec::Vec;

use crate::math::{Point, Rect};

use super::view::{Alignment, ClientHandle, PrefSizeType};
use super::Application;

/// Upper bound a layout node reports when nothing constrains it
pub const LAYOUT_MAX_SIZE: f32 = 100_000.0;

/// Relayout rounds allowed for preferred-size changes to converge
pub const MAX_LAYOUT_ITERATIONS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayoutNode {
    /// All children occupy the view's bounds
    Stacked,
    /// Children placed left to right
    Horizontal,
    /// Children placed top to bottom
    Vertical,
    /// A leaf reporting a fixed min/max, no children
    Spacer { min: Point, max: Point },
}

/// Distribute `total_size` among `count` children by weight, between their
/// min and max sizes. Children capped at their maximum are taken out and
/// the pass reruns until no cap is hit. Returns the slack nobody absorbed.
pub fn space_out(
    total_size: f32,
    min_sizes: &[f32],
    max_sizes: &[f32],
    wheights: &[f32],
    final_sizes: &mut [f32],
) -> f32 {
    let count = min_sizes.len();
    let total_min: f32 = min_sizes.iter().sum();
    let mut total_wheight: f32 = wheights.iter().sum();
    let mut extra_space = total_size - total_min;
    let mut done = alloc::vec![false; count];

    loop {
        let mut capped = None;
        for i in 0..count {
            if done[i] {
                continue;
            }
            let weight = if total_wheight > 0.0 {
                wheights[i] / total_wheight
            } else {
                0.0
            };
            final_sizes[i] = min_sizes[i] + extra_space * weight;
            if final_sizes[i] >= max_sizes[i] {
                extra_space -= max_sizes[i] - min_sizes[i];
                total_wheight -= wheights[i];
                final_sizes[i] = max_sizes[i];
                done[i] = true;
                capped = Some(i);
                break;
            }
        }
        if capped.is_none() {
            break;
        }
    }

    let mut unused = total_size;
    for size in final_sizes.iter() {
        unused -= size;
    }
    unused
}

impl Application {
    /// Preferred size of a view, ring members and overrides applied,
    /// served from the per-view cache.
    pub fn get_preferred_size(&mut self, handle: ClientHandle, size_type: PrefSizeType) -> Point {
        if let Some(view) = self.views.get(&handle) {
            if view.preferred_sizes_valid {
                return view.preferred_sizes[size_type as usize];
            }
        }

        let (mut smallest, mut greatest) = self.calculate_preferred_size(handle);
        if let Some(view) = self.views.get(&handle) {
            view.apply_size_overrides(&mut smallest, &mut greatest);
        }

        // A ring member reports the ring-wide maximum of the smallest
        // sizes; the greatest collapses to it so every member lays out to
        // the same span.
        let width_ring = self.ring_members(handle, true);
        if width_ring.len() > 1 {
            for &member in &width_ring {
                if member == handle {
                    continue;
                }
                let (mut member_small, mut member_great) = self.calculate_preferred_size(member);
                if let Some(view) = self.views.get(&member) {
                    view.apply_size_overrides(&mut member_small, &mut member_great);
                }
                if member_small.x > smallest.x {
                    smallest.x = member_small.x;
                }
            }
            greatest.x = smallest.x;
        }
        let height_ring = self.ring_members(handle, false);
        if height_ring.len() > 1 {
            for &member in &height_ring {
                if member == handle {
                    continue;
                }
                let (mut member_small, mut member_great) = self.calculate_preferred_size(member);
                if let Some(view) = self.views.get(&member) {
                    view.apply_size_overrides(&mut member_small, &mut member_great);
                }
                if member_small.y > smallest.y {
                    smallest.y = member_small.y;
                }
            }
            greatest.y = smallest.y;
        }

        if let Some(view) = self.views.get_mut(&handle) {
            view.preferred_sizes = [smallest, greatest];
            view.preferred_sizes_valid = true;
        }
        match size_type {
            PrefSizeType::Smallest => smallest,
            PrefSizeType::Greatest => greatest,
        }
    }

    /// Raw preferred size pair from the handler or the layout node, before
    /// overrides and rings.
    fn calculate_preferred_size(&mut self, handle: ClientHandle) -> (Point, Point) {
        // Content hook first: widgets that measure text land here.
        if let Some(mut handler) = self.take_handler(handle) {
            let content = handler.content_size(self, handle);
            self.put_handler(handle, handler);
            if let Some(pair) = content {
                return pair;
            }
        }

        let Some(view) = self.views.get(&handle) else {
            return (Point::default(), Point::default());
        };
        let node = view.layout_node;
        let borders = view.borders;
        let children = self.layout_children(handle);

        let (mut smallest, mut greatest) = match node {
            LayoutNode::Spacer { min, max } => (min, max),
            LayoutNode::Stacked => {
                let mut smallest = Point::default();
                let mut greatest = Point::default();
                for &child in &children {
                    let child_small = self.get_preferred_size(child, PrefSizeType::Smallest);
                    let child_great = self.get_preferred_size(child, PrefSizeType::Greatest);
                    smallest.x = max_f(smallest.x, child_small.x);
                    smallest.y = max_f(smallest.y, child_small.y);
                    greatest.x = max_f(greatest.x, child_great.x);
                    greatest.y = max_f(greatest.y, child_great.y);
                }
                if children.is_empty() {
                    greatest = Point::new(LAYOUT_MAX_SIZE, LAYOUT_MAX_SIZE);
                }
                (smallest, greatest)
            }
            LayoutNode::Horizontal => {
                let mut smallest = Point::default();
                let mut greatest = Point::default();
                for &child in &children {
                    let child_small = self.get_preferred_size(child, PrefSizeType::Smallest);
                    let child_great = self.get_preferred_size(child, PrefSizeType::Greatest);
                    smallest.x += child_small.x;
                    greatest.x += child_great.x;
                    smallest.y = max_f(smallest.y, child_small.y);
                    greatest.y = max_f(greatest.y, child_great.y);
                }
                (smallest, greatest)
            }
            LayoutNode::Vertical => {
                let mut smallest = Point::default();
                let mut greatest = Point::default();
                for &child in &children {
                    let child_small = self.get_preferred_size(child, PrefSizeType::Smallest);
                    let child_great = self.get_preferred_size(child, PrefSizeType::Greatest);
                    smallest.y += child_small.y;
                    greatest.y += child_great.y;
                    smallest.x = max_f(smallest.x, child_small.x);
                    greatest.x = max_f(greatest.x, child_great.x);
                }
                (smallest, greatest)
            }
        };

        let border_size = Point::new(
            borders.left + borders.right,
            borders.top + borders.bottom,
        );
        smallest += border_size;
        greatest += border_size;
        smallest = smallest.ceil();
        greatest = greatest.floor();
        if greatest.x < smallest.x {
            greatest.x = smallest.x;
        }
        if greatest.y < smallest.y {
            greatest.y = smallest.y;
        }
        (smallest, greatest)
    }

    /// Children participating in layout (hidden ones with IgnoreWhenHidden
    /// drop out).
    fn layout_children(&self, handle: ClientHandle) -> Vec<ClientHandle> {
        use crate::appserver::protocol::view_flags;
        let Some(view) = self.views.get(&handle) else { return Vec::new() };
        view.children
            .iter()
            .copied()
            .filter(|child| {
                self.views
                    .get(child)
                    .map(|c| c.is_visible() || !c.has_flag(view_flags::IGNORE_WHEN_HIDDEN))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Mark a view for relayout; the pass runs from `commit_layouts`.
    pub fn invalidate_layout(&mut self, handle: ClientHandle) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.layout_valid = false;
            view.preferred_sizes_valid = false;
        }
        // Size changes bubble: the parent may need to re-place siblings.
        let parent = self.views.get(&handle).and_then(|v| v.parent);
        if let Some(parent) = parent {
            if let Some(parent_view) = self.views.get_mut(&parent) {
                parent_view.preferred_sizes_valid = false;
            }
        }
    }

    /// Run pending layouts until they settle, bounded by
    /// `MAX_LAYOUT_ITERATIONS`.
    pub fn commit_layouts(&mut self) {
        for _ in 0..MAX_LAYOUT_ITERATIONS {
            let pending: Vec<ClientHandle> = self
                .views
                .values()
                .filter(|v| !v.layout_valid)
                .map(|v| v.handle)
                .collect();
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Some(view) = self.views.get_mut(&handle) {
                    view.layout_valid = true;
                }
                self.layout_view(handle);
            }
        }
        crate::log_warn!("[gui] layout did not converge");
    }

    fn layout_view(&mut self, handle: ClientHandle) {
        let Some(view) = self.views.get(&handle) else { return };
        let node = view.layout_node;
        match node {
            LayoutNode::Stacked => self.layout_stacked(handle),
            LayoutNode::Horizontal => self.layout_oriented(handle, true),
            LayoutNode::Vertical => self.layout_oriented(handle, false),
            LayoutNode::Spacer { .. } => {}
        }
    }

    fn content_bounds(&self, handle: ClientHandle) -> Rect {
        let view = &self.views[&handle];
        let mut bounds = view.bounds();
        bounds.resize(
            view.borders.left,
            view.borders.top,
            -view.borders.right,
            -view.borders.bottom,
        );
        bounds
    }

    fn layout_stacked(&mut self, handle: ClientHandle) {
        let bounds = self.content_bounds(handle);
        let children = self.layout_children(handle);
        for child in children {
            self.set_view_frame(child, bounds);
        }
    }

    /// Weighted placement along one axis; the cross axis is clamped to the
    /// child's maximum and aligned.
    fn layout_oriented(&mut self, handle: ClientHandle, horizontal: bool) {
        let bounds = self.content_bounds(handle);
        let children = self.layout_children(handle);
        if children.is_empty() {
            return;
        }

        let mut min_main = Vec::with_capacity(children.len());
        let mut max_main = Vec::with_capacity(children.len());
        let mut max_cross = Vec::with_capacity(children.len());
        let mut wheights = Vec::with_capacity(children.len());
        for &child in &children {
            let small = self.get_preferred_size(child, PrefSizeType::Smallest);
            let great = self.get_preferred_size(child, PrefSizeType::Greatest);
            if horizontal {
                min_main.push(small.x);
                max_main.push(great.x);
                max_cross.push(great.y);
            } else {
                min_main.push(small.y);
                max_main.push(great.y);
                max_cross.push(great.x);
            }
            wheights.push(self.views[&child].wheight);
        }

        let total = if horizontal { bounds.width() } else { bounds.height() };
        let mut final_sizes = alloc::vec![0.0f32; children.len()];
        let unused = space_out(total, &min_main, &max_main, &wheights, &mut final_sizes);
        let padding = max_f(unused, 0.0) / children.len() as f32;

        let mut cursor = (if horizontal { bounds.left } else { bounds.top }) + padding * 0.5;
        for (i, &child) in children.iter().enumerate() {
            let main = final_sizes[i];
            let cross_max = max_cross[i];
            let frame = if horizontal {
                let height = min_f(bounds.height(), cross_max);
                let y = align_offset(
                    self.views[&child].v_align,
                    bounds.top,
                    bounds.height(),
                    height,
                );
                Rect::new(cursor, y, cursor + main, y + height)
            } else {
                let width = min_f(bounds.width(), cross_max);
                let x = align_offset(
                    self.views[&child].h_align,
                    bounds.left,
                    bounds.width(),
                    width,
                );
                Rect::new(x, cursor, x + width, cursor + main)
            };
            cursor += main + padding;
            let mut frame = frame;
            frame.floor();
            self.set_view_frame(child, frame);
        }
    }

    /// Merge `handle` into the same-width or same-height ring of `other`.
    pub fn add_to_ring(&mut self, handle: ClientHandle, other: ClientHandle, width: bool) {
        if handle == other || !self.views.contains_key(&handle) || !self.views.contains_key(&other)
        {
            return;
        }
        // Splice: handle takes other's next, other points at handle.
        let other_next = {
            let other_view = &self.views[&other];
            let next = if width { other_view.width_ring_next } else { other_view.height_ring_next };
            next.unwrap_or(other)
        };
        {
            let view = self.views.get_mut(&handle).unwrap();
            if width {
                view.width_ring_next = Some(other_next);
            } else {
                view.height_ring_next = Some(other_next);
            }
        }
        {
            let other_view = self.views.get_mut(&other).unwrap();
            if width {
                other_view.width_ring_next = Some(handle);
            } else {
                other_view.height_ring_next = Some(handle);
            }
        }
        for member in self.ring_members(handle, width) {
            if let Some(view) = self.views.get_mut(&member) {
                view.preferred_sizes_valid = false;
            }
        }
    }

    /// Every member of the ring `handle` belongs to, itself included.
    fn ring_members(&self, handle: ClientHandle, width: bool) -> Vec<ClientHandle> {
        let mut members = alloc::vec![handle];
        let mut current = handle;
        loop {
            let next = match self.views.get(&current) {
                Some(view) => {
                    if width {
                        view.width_ring_next
                    } else {
                        view.height_ring_next
                    }
                }
                None => None,
            };
            match next {
                Some(next) if next != handle => {
                    members.push(next);
                    current = next;
                    if members.len() > self.views.len() {
                        break; // corrupt ring
                    }
                }
                _ => break,
            }
        }
        members
    }
}

fn align_offset(alignment: Alignment, start: f32, available: f32, used: f32) -> f32 {
    match alignment {
        Alignment::Left | Alignment::Top => start,
        Alignment::Right | Alignment::Bottom => start + available - used,
        Alignment::Center | Alignment::Stretch => start + (available - used) * 0.5,
    }
}

fn max_f(a: f32, b: f32) -> f32 {
    if a > b { a } else { b }
}

fn min_f(a: f32, b: f32) -> f32 {
    if a < b { a } else { b }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_out_distributes_by_wheight_with_caps() {
        // The middle child caps at 80; the remainder splits 1:1.
        let min = [10.0, 50.0, 10.0];
        let max = [100.0, 80.0, 1000.0];
        let wheights = [1.0, 2.0, 1.0];
        let mut finals = [0.0f32; 3];
        let unused = space_out(300.0, &min, &max, &wheights, &mut finals);

        let total: f32 = finals.iter().sum();
        assert!((total + unused - 300.0).abs() < 0.01);
        for i in 0..3 {
            assert!(finals[i] >= min[i] - 0.01, "{} below min", i);
            assert!(finals[i] <= max[i] + 0.01, "{} above max", i);
        }
        // 300 total: mid capped at 80, leaving 220 for the outer two.
        assert!((finals[1] - 80.0).abs() < 0.01);
        assert!((finals[0] - 100.0).abs() < 0.01, "first caps too: {finals:?}");
        assert!((finals[2] - 120.0).abs() < 0.01, "{finals:?}");
        assert!(unused.abs() < 0.01);
    }

    #[test]
    fn space_out_reports_unused_slack() {
        let min = [10.0, 10.0];
        let max = [20.0, 20.0];
        let wheights = [1.0, 1.0];
        let mut finals = [0.0f32; 2];
        let unused = space_out(100.0, &min, &max, &wheights, &mut finals);
        assert!((finals[0] - 20.0).abs() < 0.01);
        assert!((finals[1] - 20.0).abs() < 0.01);
        assert!((unused - 60.0).abs() < 0.01);
    }
}
