use std::collections::HashSet;

use crate::queue::Dir;

/// Traceable wire items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceItem {
    /// Connection open/close events.
    Conn = 0,
    /// Request and status lines.
    FirstLine = 1,
    /// Message headers.
    Headers = 2,
    /// Body content.
    Body = 3,
    /// Limit violations.
    Limits = 4,
    /// Request timing.
    Time = 5,
}

const ITEMS: usize = 6;

/// Wire tracing configuration: a numeric verbosity per direction and
/// item, with include/exclude extension filters. Emission itself goes
/// through the `tracing` crate; this filter only gates it.
#[derive(Debug, Clone)]
pub struct TraceFilter {
    levels: [[i8; ITEMS]; 2],
    include: Option<HashSet<String>>,
    exclude: HashSet<String>,
}

impl TraceFilter {
    /// Tracing disabled for every item.
    pub fn disabled() -> TraceFilter {
        TraceFilter {
            levels: [[-1; ITEMS]; 2],
            include: None,
            exclude: HashSet::new(),
        }
    }

    /// Set the verbosity for one direction and item. Negative disables.
    pub fn set_level(&mut self, dir: Dir, item: TraceItem, level: i8) {
        self.levels[dir_index(dir)][item as usize] = level;
    }

    /// Only trace requests whose extension is in the include set.
    pub fn include_extension(&mut self, ext: impl Into<String>) {
        self.include
            .get_or_insert_with(HashSet::new)
            .insert(ext.into());
    }

    /// Never trace requests with this extension.
    pub fn exclude_extension(&mut self, ext: impl Into<String>) {
        self.exclude.insert(ext.into());
    }

    /// The verbosity for `item` in `dir`, or `None` when filtered out.
    pub fn should_trace(&self, dir: Dir, item: TraceItem, ext: Option<&str>) -> Option<u8> {
        if let Some(ext) = ext {
            if self.exclude.contains(ext) {
                return None;
            }
            if let Some(ref include) = self.include {
                if !include.contains(ext) {
                    return None;
                }
            }
        }
        let level = self.levels[dir_index(dir)][item as usize];
        if level < 0 {
            None
        } else {
            Some(level as u8)
        }
    }
}

impl Default for TraceFilter {
    /// First lines and headers at a modest level, bodies disabled.
    fn default() -> TraceFilter {
        let mut filter = TraceFilter::disabled();
        filter.set_level(Dir::Rx, TraceItem::FirstLine, 2);
        filter.set_level(Dir::Rx, TraceItem::Headers, 3);
        filter.set_level(Dir::Tx, TraceItem::FirstLine, 2);
        filter.set_level(Dir::Tx, TraceItem::Headers, 3);
        filter
    }
}

fn dir_index(dir: Dir) -> usize {
    match dir {
        Dir::Rx => 0,
        Dir::Tx => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_gate_by_direction_and_item() {
        let filter = TraceFilter::default();
        assert_eq!(filter.should_trace(Dir::Rx, TraceItem::FirstLine, None), Some(2));
        assert_eq!(filter.should_trace(Dir::Rx, TraceItem::Body, None), None);
    }

    #[test]
    fn extension_filters() {
        let mut filter = TraceFilter::default();
        filter.exclude_extension("gif");
        assert_eq!(filter.should_trace(Dir::Rx, TraceItem::Headers, Some("gif")), None);
        assert!(filter.should_trace(Dir::Rx, TraceItem::Headers, Some("html")).is_some());

        filter.include_extension("html");
        assert_eq!(filter.should_trace(Dir::Rx, TraceItem::Headers, Some("txt")), None);
        assert!(filter.should_trace(Dir::Rx, TraceItem::Headers, Some("html")).is_some());
    }
}
