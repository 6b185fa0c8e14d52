//! Line-window chunking
//!
//! Splits a body of text (file contents or a diff) into fixed-size line
//! windows. Lines keep their terminators, so joining the chunks of a body
//! gives back the body unchanged.

use std::path::{Path, PathBuf};

/// One bounded slice of lines handed to the backend as a single unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the run's chunk sequence (dense, 0-based)
    pub index: usize,
    /// Language identifier used to pick prompts and test conventions
    pub language: String,
    /// File the lines came from, if the chunk was cut from a file
    pub origin: Option<PathBuf>,
    /// 1-based line number of the first line within its origin
    pub first_line: usize,
    pub text: String,
}

impl Chunk {
    pub fn line_count(&self) -> usize {
        self.text.split_inclusive('\n').count()
    }

    /// Short human label for logs, e.g. `src/main.go:41`.
    pub fn location(&self) -> String {
        match &self.origin {
            Some(path) => format!("{}:{}", path.display(), self.first_line),
            None => format!("line {}", self.first_line),
        }
    }
}

/// Lazy iterator over the line windows of a body.
///
/// Cheap to clone; a clone restarts from wherever the original was, and
/// calling [`chunk_lines`] again restarts from the top.
#[derive(Debug, Clone)]
pub struct LineWindows<'a> {
    rest: &'a str,
    size: usize,
    next_line: usize,
}

/// Split `body` into windows of `size` lines (the last may be shorter).
///
/// A `size` of zero is treated as one line per window; configuration
/// validation rejects zero before it gets here.
pub fn chunk_lines(body: &str, size: usize) -> LineWindows<'_> {
    LineWindows {
        rest: body,
        size: size.max(1),
        next_line: 1,
    }
}

impl<'a> Iterator for LineWindows<'a> {
    /// (1-based first line, window text)
    type Item = (usize, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let mut end = 0;
        let mut taken = 0;
        for line in self.rest.split_inclusive('\n') {
            end += line.len();
            taken += 1;
            if taken == self.size {
                break;
            }
        }

        let (window, rest) = self.rest.split_at(end);
        let first_line = self.next_line;
        self.rest = rest;
        self.next_line += taken;
        Some((first_line, window))
    }
}

/// Accumulates chunks from several units into one densely indexed sequence.
///
/// Each unit is chunked on its own and appended, so no chunk ever mixes
/// lines from two files.
#[derive(Debug, Default)]
pub struct ChunkSequence {
    chunks: Vec<Chunk>,
}

impl ChunkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the windows of one unit of text.
    pub fn push_unit(&mut self, body: &str, size: usize, language: &str, origin: Option<&Path>) {
        for (first_line, text) in chunk_lines(body, size) {
            let index = self.chunks.len();
            self.chunks.push(Chunk {
                index,
                language: language.to_string(),
                origin: origin.map(Path::to_path_buf),
                first_line,
                text: text.to_string(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn into_vec(self) -> Vec<Chunk> {
        self.chunks
    }
}
