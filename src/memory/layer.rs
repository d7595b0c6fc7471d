// Free layers: one intrusive LIFO list of equal-order free spans per span
// order, plus an ordered set of the non-empty layers so allocation can find
// the smallest layer that still fits.

use std::collections::BTreeSet;

use crate::memory::span::{SpanArena, SpanId, SpanOrder};

/// Doubly-linked LIFO list of free spans of one order. Pushing to the front
/// keeps the most recently freed span first, which preserves cache locality
/// on reuse.
#[derive(Debug)]
pub struct SpanLayer {
    layer_id: SpanOrder,
    head: Option<SpanId>,
    len: usize,
}

impl SpanLayer {
    pub fn new(layer_id: SpanOrder) -> Self {
        Self {
            layer_id,
            head: None,
            len: 0,
        }
    }

    pub fn layer_id(&self) -> SpanOrder {
        self.layer_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, arena: &mut SpanArena, id: SpanId) {
        debug_assert!(arena.get(id).in_layer.is_none());
        let old_head = self.head;
        {
            let span = arena.get_mut(id);
            span.prev_free = None;
            span.next_free = old_head;
            span.in_layer = Some(self.layer_id);
        }
        if let Some(old) = old_head {
            arena.get_mut(old).prev_free = Some(id);
        }
        self.head = Some(id);
        self.len += 1;
    }

    pub fn pop_front(&mut self, arena: &mut SpanArena) -> Option<SpanId> {
        let id = self.head?;
        self.remove(arena, id);
        Some(id)
    }

    pub fn remove(&mut self, arena: &mut SpanArena, id: SpanId) {
        debug_assert_eq!(arena.get(id).in_layer, Some(self.layer_id));
        let (prev, next) = {
            let span = arena.get(id);
            (span.prev_free, span.next_free)
        };
        match prev {
            Some(prev) => arena.get_mut(prev).next_free = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            arena.get_mut(next).prev_free = prev;
        }
        let span = arena.get_mut(id);
        span.prev_free = None;
        span.next_free = None;
        span.in_layer = None;
        self.len -= 1;
    }
}

/// Lookup of non-empty layers, ordered by layer id.
#[derive(Debug, Default)]
pub struct LayerLookup {
    ids: BTreeSet<SpanOrder>,
}

impl LayerLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_layer_add_span(&mut self, layer: &SpanLayer) {
        if layer.len() == 1 {
            self.ids.insert(layer.layer_id());
        }
    }

    pub fn on_layer_remove_span(&mut self, layer: &SpanLayer) {
        if layer.is_empty() {
            self.ids.remove(&layer.layer_id());
        }
    }

    /// Smallest non-empty layer with id >= `order`, lifted at most
    /// `max_lift` layers above it.
    pub fn find_fit(&self, order: SpanOrder, max_lift: usize) -> Option<SpanOrder> {
        let found = self.ids.range(order..).next().copied()?;
        if (found - order) as usize > max_lift {
            return None;
        }
        Some(found)
    }

    pub fn ids(&self) -> impl Iterator<Item = SpanOrder> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::span::PageSpan;

    #[test]
    fn layer_is_lifo() {
        let mut arena = SpanArena::new();
        let mut layer = SpanLayer::new(2);
        let a = arena.insert(PageSpan::new(0x0, 0x0, 2));
        let b = arena.insert(PageSpan::new(0x4000, 0x0, 2));
        layer.push_front(&mut arena, a);
        layer.push_front(&mut arena, b);
        assert_eq!(layer.pop_front(&mut arena), Some(b));
        assert_eq!(layer.pop_front(&mut arena), Some(a));
        assert_eq!(layer.pop_front(&mut arena), None);
    }

    #[test]
    fn remove_from_middle_bridges_links() {
        let mut arena = SpanArena::new();
        let mut layer = SpanLayer::new(1);
        let ids: Vec<_> = (0..3)
            .map(|i| arena.insert(PageSpan::new(i * 0x2000, 0x0, 1)))
            .collect();
        for &id in &ids {
            layer.push_front(&mut arena, id);
        }
        layer.remove(&mut arena, ids[1]);
        assert_eq!(layer.len(), 2);
        assert_eq!(layer.pop_front(&mut arena), Some(ids[2]));
        assert_eq!(layer.pop_front(&mut arena), Some(ids[0]));
    }

    #[test]
    fn lookup_tracks_non_empty_layers() {
        let mut arena = SpanArena::new();
        let mut layer = SpanLayer::new(3);
        let mut lookup = LayerLookup::new();
        let id = arena.insert(PageSpan::new(0x0, 0x0, 3));
        layer.push_front(&mut arena, id);
        lookup.on_layer_add_span(&layer);
        assert_eq!(lookup.find_fit(2, usize::MAX), Some(3));
        assert_eq!(lookup.find_fit(2, 0), None);
        assert_eq!(lookup.find_fit(4, usize::MAX), None);
        layer.pop_front(&mut arena);
        lookup.on_layer_remove_span(&layer);
        assert!(lookup.is_empty());
    }
}
