// Ordered finite audio-segment iterator with repeat count

/// Position moves backing the AU position key (psk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistMove {
    First,
    Last,
    Previous,
    Next,
    Current,
}

impl PlaylistMove {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "fst" => Some(PlaylistMove::First),
            "lst" => Some(PlaylistMove::Last),
            "prv" => Some(PlaylistMove::Previous),
            "nxt" => Some(PlaylistMove::Next),
            "cur" => Some(PlaylistMove::Current),
            _ => None,
        }
    }
}

/// Finite sequence yielding `segments` concatenated `repeat` times.
/// Not thread-safe; the owning driver serializes access.
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    segments: Vec<String>,
    repeat: usize,
    index: usize,
}

impl Playlist {
    pub fn new(segments: Vec<String>, repeat: usize) -> Self {
        Playlist {
            segments,
            repeat,
            index: 0,
        }
    }

    /// Build from a comma-separated URI list, dropping empty entries.
    pub fn from_csv(value: &str, repeat: usize) -> Self {
        let segments = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Playlist::new(segments, repeat)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() || self.repeat == 0
    }

    /// Yield the next segment, or None once the sequence is exhausted.
    pub fn next(&mut self) -> Option<String> {
        if self.is_empty() || self.index >= self.segments.len() * self.repeat {
            return None;
        }
        let segment = self.segments[self.index % self.segments.len()].clone();
        self.index += 1;
        Some(segment)
    }

    /// Reposition to the start of the sequence.
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// Reposition relative to the segment most recently yielded by `next`,
    /// staying within the current repetition. The repositioned segment is
    /// returned by the following `next` call.
    pub fn move_to(&mut self, direction: PlaylistMove) {
        if self.is_empty() || self.index == 0 {
            return;
        }
        let len = self.segments.len();
        let playing = self.index - 1;
        let repetition_start = playing - (playing % len);
        let repetition_last = repetition_start + len - 1;
        self.index = match direction {
            PlaylistMove::First => repetition_start,
            PlaylistMove::Last => repetition_last,
            PlaylistMove::Previous => playing.max(repetition_start + 1) - 1,
            PlaylistMove::Next => (playing + 1).min(repetition_last),
            PlaylistMove::Current => playing,
        };
    }
}
