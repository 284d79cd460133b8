//! Scan planning: list a snapshot's objects in pool-key order and slice them
//! into non-overlapping partitions.

use serde::{Deserialize, Serialize};
use silt_meta::View;
use silt_storage::{sort_objects, DataObject, Layout, Span, Value};

/// Objects whose key ranges chain together, with the union of those ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Union of the members' spans.
    pub span: Span,
    /// Members in pool-key order.
    pub objects: Vec<DataObject>,
}

impl Partition {
    /// Metadata row for `:partitions` queries.
    pub fn to_record(&self) -> Value {
        Value::record([
            ("min", self.span.lo.clone()),
            ("max", self.span.hi.clone()),
            (
                "objects",
                Value::Array(
                    self.objects
                        .iter()
                        .map(|o| Value::from(o.id.to_string()))
                        .collect(),
                ),
            ),
            (
                "count",
                Value::from(self.objects.iter().map(|o| o.count).sum::<u64>()),
            ),
            (
                "size",
                Value::from(self.objects.iter().map(|o| o.size).sum::<u64>()),
            ),
        ])
    }
}

/// Sorted object listing of a snapshot, pruned by a key span.
pub struct Lister {
    objects: std::vec::IntoIter<DataObject>,
}

impl Lister {
    /// List `view`'s objects that can hold keys in `span`.
    pub fn new(view: &dyn View, layout: &Layout, span: Option<&Span>) -> Self {
        let mut objects: Vec<DataObject> = view
            .select_all()
            .into_iter()
            .filter(|o| span.map_or(true, |s| o.span().overlaps(layout, s)))
            .collect();
        sort_objects(layout, &mut objects);
        Self {
            objects: objects.into_iter(),
        }
    }
}

impl Iterator for Lister {
    type Item = DataObject;

    fn next(&mut self) -> Option<DataObject> {
        self.objects.next()
    }
}

/// Groups sorted objects into partitions.
///
/// An object joins the current partition unless its span starts strictly
/// after the partition's span ends in pool-key order.
pub struct Slicer<I> {
    input: I,
    layout: Layout,
    current: Option<Partition>,
}

impl<I: Iterator<Item = DataObject>> Slicer<I> {
    /// Slice the objects produced by `input`, which must be sorted by
    /// `silt_storage::compare_objects` under `layout`.
    pub fn new(input: I, layout: Layout) -> Self {
        Self {
            input,
            layout,
            current: None,
        }
    }
}

impl<I: Iterator<Item = DataObject>> Iterator for Slicer<I> {
    type Item = Partition;

    fn next(&mut self) -> Option<Partition> {
        for object in self.input.by_ref() {
            let span = object.span();
            match self.current.as_mut() {
                Some(part) if !part.span.is_before(&self.layout, &span) => {
                    part.span.extend(&self.layout, &span);
                    part.objects.push(object);
                }
                _ => {
                    let done = self.current.replace(Partition {
                        span,
                        objects: vec![object],
                    });
                    if done.is_some() {
                        return done;
                    }
                }
            }
        }
        self.current.take()
    }
}

/// Plan the partitions of `view` that may hold keys in `span`.
pub fn partitions(view: &dyn View, layout: &Layout, span: Option<&Span>) -> Vec<Partition> {
    Slicer::new(Lister::new(view, layout, span), layout.clone()).collect()
}
