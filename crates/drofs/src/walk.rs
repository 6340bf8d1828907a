use crate::{Entry, Error, Image, Result};

/// An iterator for recursively walking the tree below an entry.
///
/// Created by [`Image::walk`]. Children are visited in stored order, each
/// directory's contents directly after the directory itself.
#[derive(Debug)]
pub struct Walk<'a> {
    image: Image<'a>,
    stack: Vec<Frame<'a>>,
    max_depth: usize,
}

#[derive(Debug)]
struct Frame<'a> {
    depth: usize,
    entry: Entry<'a>,
    path: String,
    next: usize,
}

/// A single entry returned by [`Walk`].
#[derive(Debug, Clone)]
pub struct WalkEntry<'a> {
    /// Depth relative to the starting entry (1-indexed).
    pub depth: usize,
    /// Slash-separated path from the image root.
    pub path: String,
    pub entry: Entry<'a>,
}

impl<'a> Walk<'a> {
    pub(crate) fn new(image: Image<'a>, start: Entry<'a>, path: &str) -> Self {
        let path = path
            .split('/')
            .filter(|s| !s.is_empty())
            .flat_map(|s| ["/", s])
            .collect();
        Self {
            image,
            stack: vec![Frame {
                depth: 1,
                entry: start,
                path,
                next: 0,
            }],
            max_depth: 0,
        }
    }

    /// Sets the maximum depth to descend into subdirectories.
    ///
    /// A depth of 1 yields only immediate children. 0 (the default) means
    /// unlimited depth.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    fn next_entry(&mut self) -> Option<Result<WalkEntry<'a>>> {
        loop {
            let frame = self.stack.last_mut()?;
            let Some(offset) = frame.entry.child_offset(frame.next) else {
                self.stack.pop();
                continue;
            };
            frame.next += 1;
            let depth = frame.depth;

            let entry = match self.image.entry_at(offset) {
                Ok(entry) => entry,
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            };
            let path = format!(
                "{}/{}",
                frame.path,
                String::from_utf8_lossy(entry.name())
            );

            if entry.is_dir() && (depth < self.max_depth || self.max_depth == 0) {
                // linear in the current depth, so a full walk is O(depth^2)
                if self.stack.iter().any(|f| f.entry.offset() == offset) {
                    log::warn!("{path}: directory refers back to an ancestor at {offset}");
                    self.stack.clear();
                    return Some(Err(Error::MalformedEntry {
                        offset,
                        field: "children",
                    }));
                }
                self.stack.push(Frame {
                    depth: depth + 1,
                    entry,
                    path: path.clone(),
                    next: 0,
                });
            }

            return Some(Ok(WalkEntry { depth, path, entry }));
        }
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = Result<WalkEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}
